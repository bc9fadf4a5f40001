//! Final image containers: raw binary, Game Boy cartridge, and iNES.
//!
//! The compiler hands over finished banks plus the program's `config`
//! entries; the writer selected by the `format` key lays them out in a
//! single output file.

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;

use wizc_core::bank::BankKind;
use wizc_core::expr::{Expression, ExpressionKind};
use wizc_core::{BankImage, CompileOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Raw,
    GameBoy,
    Nes,
}

impl OutputFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "raw" | "bin" => Some(Self::Raw),
            "gb" | "gbc" => Some(Self::GameBoy),
            "nes" => Some(Self::Nes),
            _ => None,
        }
    }
}

const RECOGNIZED_KEYS: &[&str] = &["format", "title", "pad"];

/// Settings extracted from the program's `config { ... }` block.
#[derive(Debug, Clone)]
pub struct FormatConfig {
    pub format: OutputFormat,
    pub title: String,
    pub pad: u8,
}

impl FormatConfig {
    pub fn from_entries(config: &IndexMap<String, Expression>) -> Result<Self> {
        for key in config.keys() {
            if !RECOGNIZED_KEYS.contains(&key.as_str()) {
                bail!("unrecognized config key '{key}'");
            }
        }

        let format = match config.get("format") {
            Some(value) => {
                let name = string_value(value)
                    .context("config 'format' must be a string literal")?;
                OutputFormat::from_name(&name)
                    .with_context(|| format!("unknown output format '{name}'"))?
            }
            None => OutputFormat::Raw,
        };

        let title = match config.get("title") {
            Some(value) => string_value(value).context("config 'title' must be a string")?,
            None => String::new(),
        };

        let pad = match config.get("pad") {
            Some(value) => {
                let pad = integer_value(value).context("config 'pad' must be an integer")?;
                u8::try_from(pad).context("config 'pad' must fit in a byte")?
            }
            None => 0xFF,
        };

        Ok(Self { format, title, pad })
    }
}

fn string_value(expr: &Expression) -> Option<String> {
    match &expr.kind {
        ExpressionKind::StringLiteral(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
        _ => None,
    }
}

fn integer_value(expr: &Expression) -> Option<i128> {
    expr.known_integer()
}

/// Render the compiled banks into one output file.
pub fn generate(output: &CompileOutput) -> Result<Vec<u8>> {
    let config = FormatConfig::from_entries(&output.config)?;
    generate_with_config(output, &config)
}

pub fn generate_with_config(output: &CompileOutput, config: &FormatConfig) -> Result<Vec<u8>> {
    match config.format {
        OutputFormat::Raw => generate_raw(output),
        OutputFormat::GameBoy => generate_game_boy(output, config),
        OutputFormat::Nes => generate_nes(output),
    }
}

fn stored_banks(output: &CompileOutput) -> impl Iterator<Item = &BankImage> {
    output
        .banks
        .iter()
        .filter(|bank| bank.kind.stores_bytes())
}

/// Stored banks concatenated in declaration order.
fn generate_raw(output: &CompileOutput) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for bank in stored_banks(output) {
        bytes.extend_from_slice(&bank.bytes);
    }
    if bytes.is_empty() {
        bail!("no stored bank produced any output");
    }
    Ok(bytes)
}

/// Nintendo logo bitmap verified by the boot rom; a cartridge without it
/// does not start.
const GB_LOGO: [u8; 48] = [
    0xCE, 0xED, 0x66, 0x66, 0xCC, 0x0D, 0x00, 0x0B, 0x03, 0x73, 0x00, 0x83, 0x00, 0x0C, 0x00,
    0x0D, 0x00, 0x08, 0x11, 0x1F, 0x88, 0x89, 0x00, 0x0E, 0xDC, 0xCC, 0x6E, 0xE6, 0xDD, 0xDD,
    0xD9, 0x99, 0xBB, 0xBB, 0x67, 0x63, 0x6E, 0x0E, 0xEC, 0xCC, 0xDD, 0xDC, 0x99, 0x9F, 0xBB,
    0xB9, 0x33, 0x3E,
];

fn generate_game_boy(output: &CompileOutput, config: &FormatConfig) -> Result<Vec<u8>> {
    let mut rom = generate_raw(output)?;

    // Pad to the next valid power-of-two cartridge size, minimum 32 KiB.
    let mut size = 0x8000usize;
    while size < rom.len() {
        size *= 2;
    }
    rom.resize(size, config.pad);

    rom[0x104..0x134].copy_from_slice(&GB_LOGO);

    // Title: up to 15 bytes, zero padded.
    let title = config.title.as_bytes();
    if title.len() > 15 {
        bail!("game boy titles are limited to 15 characters");
    }
    for (index, slot) in rom[0x134..0x143].iter_mut().enumerate() {
        *slot = title.get(index).copied().unwrap_or(0);
    }

    // Cartridge type: rom only. Rom size code: log2(size / 32 KiB).
    rom[0x147] = 0x00;
    rom[0x148] = (size / 0x8000).trailing_zeros() as u8;
    rom[0x149] = 0x00;

    // Header checksum over 0x134..=0x14C.
    let mut checksum = 0u8;
    for index in 0x134..=0x14C {
        checksum = checksum.wrapping_sub(rom[index]).wrapping_sub(1);
    }
    rom[0x14D] = checksum;

    // Global checksum (big-endian) over everything except its own bytes.
    rom[0x14E] = 0;
    rom[0x14F] = 0;
    let mut global = 0u16;
    for byte in &rom {
        global = global.wrapping_add(*byte as u16);
    }
    rom[0x14E] = (global >> 8) as u8;
    rom[0x14F] = (global & 0xFF) as u8;

    Ok(rom)
}

const NES_PRG_UNIT: usize = 0x4000;
const NES_CHR_UNIT: usize = 0x2000;

fn generate_nes(output: &CompileOutput) -> Result<Vec<u8>> {
    let mut prg = Vec::new();
    let mut chr = Vec::new();
    for bank in stored_banks(output) {
        match bank.kind {
            BankKind::Rom => prg.extend_from_slice(&bank.bytes),
            BankKind::CharacterRom => chr.extend_from_slice(&bank.bytes),
            BankKind::Ram => {}
        }
    }
    if prg.is_empty() {
        bail!("an nes image needs at least one prg rom bank");
    }
    if prg.len() % NES_PRG_UNIT != 0 {
        bail!(
            "prg rom size {:#X} is not a multiple of 16 KiB",
            prg.len()
        );
    }
    if chr.len() % NES_CHR_UNIT != 0 {
        bail!(
            "chr rom size {:#X} is not a multiple of 8 KiB",
            chr.len()
        );
    }

    let mut bytes = Vec::with_capacity(16 + prg.len() + chr.len());
    bytes.extend_from_slice(b"NES\x1A");
    bytes.push((prg.len() / NES_PRG_UNIT) as u8);
    bytes.push((chr.len() / NES_CHR_UNIT) as u8);
    bytes.extend_from_slice(&[0; 10]);
    bytes.extend_from_slice(&prg);
    bytes.extend_from_slice(&chr);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wizc_core::span::{SourceId, Span};

    fn bank(name: &str, kind: BankKind, origin: u64, bytes: Vec<u8>) -> BankImage {
        BankImage {
            name: name.to_string(),
            kind,
            origin: Some(origin),
            bytes,
        }
    }

    fn string_entry(value: &str) -> Expression {
        Expression::new(
            ExpressionKind::StringLiteral(value.as_bytes().to_vec()),
            Span::point(SourceId(0), 0),
        )
    }

    fn output(banks: Vec<BankImage>, config: &[(&str, Expression)]) -> CompileOutput {
        CompileOutput {
            banks,
            config: config
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect(),
        }
    }

    #[test]
    fn raw_output_concatenates_stored_banks() {
        let output = output(
            vec![
                bank("zp", BankKind::Ram, 0, Vec::new()),
                bank("prg", BankKind::Rom, 0x8000, vec![0xA9, 0x01]),
                bank("chr", BankKind::CharacterRom, 0, vec![0x55]),
            ],
            &[],
        );
        assert_eq!(generate(&output).expect("raw"), vec![0xA9, 0x01, 0x55]);
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        let output = output(
            vec![bank("prg", BankKind::Rom, 0x8000, vec![0xEA])],
            &[("mapper", string_entry("mmc3"))],
        );
        let err = generate(&output).expect_err("must fail");
        assert!(err.to_string().contains("unrecognized config key"));
    }

    #[test]
    fn game_boy_header_checksum_is_valid() {
        let output = output(
            vec![bank("home", BankKind::Rom, 0, vec![0x00; 0x8000])],
            &[
                ("format", string_entry("gb")),
                ("title", string_entry("WIZTEST")),
            ],
        );
        let rom = generate(&output).expect("gb");
        assert_eq!(rom.len(), 0x8000);
        assert_eq!(&rom[0x104..0x134], &GB_LOGO[..]);
        assert_eq!(&rom[0x134..0x13B], b"WIZTEST");

        let mut checksum = 0u8;
        for index in 0x134..=0x14C {
            checksum = checksum.wrapping_sub(rom[index]).wrapping_sub(1);
        }
        assert_eq!(rom[0x14D], checksum);
    }

    #[test]
    fn nes_header_counts_prg_and_chr_units() {
        let output = output(
            vec![
                bank("prg", BankKind::Rom, 0x8000, vec![0xEA; 0x8000]),
                bank("chr", BankKind::CharacterRom, 0, vec![0x00; 0x2000]),
            ],
            &[("format", string_entry("nes"))],
        );
        let image = generate(&output).expect("nes");
        assert_eq!(&image[..4], b"NES\x1A");
        assert_eq!(image[4], 2);
        assert_eq!(image[5], 1);
        assert_eq!(image.len(), 16 + 0x8000 + 0x2000);
    }

    #[test]
    fn nes_requires_whole_prg_units() {
        let output = output(
            vec![bank("prg", BankKind::Rom, 0x8000, vec![0xEA; 0x1000])],
            &[("format", string_entry("nes"))],
        );
        assert!(generate(&output).is_err());
    }
}
