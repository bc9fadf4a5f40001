use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BankId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankKind {
    /// Reservation-only working memory (`vardata`).
    Ram,
    /// Stored program/data memory (`prgdata`, `constdata`).
    Rom,
    /// Stored character/tile memory (`chrdata`).
    CharacterRom,
}

impl BankKind {
    /// Whether bytes written here end up in the output image.
    pub fn stores_bytes(self) -> bool {
        matches!(self, Self::Rom | Self::CharacterRom)
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Ram => "ram",
            Self::Rom => "rom",
            Self::CharacterRom => "character rom",
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(
        "{description} needs {size} byte(s), but bank '{bank}' only has {remaining} byte(s) left"
    )]
    OutOfSpace {
        bank: String,
        description: String,
        size: usize,
        remaining: usize,
    },
    #[error("address {address:#X} is outside bank '{bank}' ({start:#X}..{end:#X})")]
    SeekOutOfRange {
        bank: String,
        address: u64,
        start: u64,
        end: u64,
    },
    #[error(
        "{description} overlaps '{previous}' at offset {offset:#X} in bank '{bank}'"
    )]
    Overlap {
        bank: String,
        description: String,
        previous: String,
        offset: usize,
    },
    #[error("cannot write data into {kind} bank '{bank}'")]
    NotStored { bank: String, kind: &'static str },
}

#[derive(Debug, Clone)]
struct Reservation {
    start: usize,
    len: usize,
    description: String,
}

/// A named region of the target address space: a relative cursor over a
/// byte buffer, with reservation bookkeeping shared by both codegen passes.
#[derive(Debug)]
pub struct Bank {
    pub name: String,
    pub kind: BankKind,
    pub origin: Option<u64>,
    pub capacity: usize,
    pub pad_byte: u8,
    cursor: usize,
    max_written: usize,
    bytes: Vec<u8>,
    owned: Vec<bool>,
    reservations: Vec<Reservation>,
    /// Overlap detection runs on the first pass through; after `rewind()` the
    /// write pass revisits the same regions on purpose.
    check_overlap: bool,
}

impl Bank {
    pub fn new(
        name: impl Into<String>,
        kind: BankKind,
        origin: Option<u64>,
        capacity: usize,
        pad_byte: u8,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            origin,
            capacity,
            pad_byte,
            cursor: 0,
            max_written: 0,
            bytes: if kind.stores_bytes() {
                vec![pad_byte; capacity]
            } else {
                Vec::new()
            },
            owned: vec![false; capacity],
            reservations: Vec::new(),
            check_overlap: true,
        }
    }

    pub fn relative_position(&self) -> usize {
        self.cursor
    }

    /// Absolute address of the cursor, when the bank has an origin.
    pub fn current_address(&self) -> Option<u64> {
        self.origin.map(|origin| origin + self.cursor as u64)
    }

    pub fn max_written(&self) -> usize {
        self.max_written
    }

    pub fn absolute_seek(&mut self, address: u64) -> Result<(), StorageError> {
        match self.origin {
            Some(origin) => {
                let end = origin + self.capacity as u64;
                if address < origin || address >= end {
                    return Err(StorageError::SeekOutOfRange {
                        bank: self.name.clone(),
                        address,
                        start: origin,
                        end,
                    });
                }
                self.cursor = (address - origin) as usize;
                Ok(())
            }
            None => {
                // No origin declared yet: treat the address as a relative
                // position within the bank.
                if address >= self.capacity as u64 {
                    return Err(StorageError::SeekOutOfRange {
                        bank: self.name.clone(),
                        address,
                        start: 0,
                        end: self.capacity as u64,
                    });
                }
                self.cursor = address as usize;
                Ok(())
            }
        }
    }

    /// Relative seek used to restore the cursor after an absolute placement.
    pub fn seek_relative(&mut self, position: usize) {
        self.cursor = position;
    }

    /// Advance the cursor over `size` bytes without producing data, claiming
    /// the region. Returns the starting relative position.
    pub fn reserve(&mut self, description: &str, size: usize) -> Result<usize, StorageError> {
        let start = self.cursor;
        let remaining = self.capacity.saturating_sub(start);
        if size > remaining {
            return Err(StorageError::OutOfSpace {
                bank: self.name.clone(),
                description: description.to_string(),
                size,
                remaining,
            });
        }

        if self.check_overlap {
            if let Some(offset) = (start..start + size).find(|index| self.owned[*index]) {
                let previous = self
                    .reservations
                    .iter()
                    .find(|reservation| {
                        offset >= reservation.start && offset < reservation.start + reservation.len
                    })
                    .map(|reservation| reservation.description.clone())
                    .unwrap_or_else(|| "earlier reservation".to_string());
                return Err(StorageError::Overlap {
                    bank: self.name.clone(),
                    description: description.to_string(),
                    previous,
                    offset,
                });
            }
            for index in start..start + size {
                self.owned[index] = true;
            }
            self.reservations.push(Reservation {
                start,
                len: size,
                description: description.to_string(),
            });
        }

        self.cursor = start + size;
        self.max_written = self.max_written.max(self.cursor);
        Ok(start)
    }

    /// Copy bytes into the backing buffer at the cursor and advance.
    pub fn write(&mut self, description: &str, data: &[u8]) -> Result<usize, StorageError> {
        if !self.kind.stores_bytes() {
            return Err(StorageError::NotStored {
                bank: self.name.clone(),
                kind: self.kind.describe(),
            });
        }
        let start = self.reserve(description, data.len())?;
        self.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(start)
    }

    /// Reset the cursor between codegen passes, keeping the reservation map.
    pub fn rewind(&mut self) {
        self.cursor = 0;
        self.check_overlap = false;
    }

    /// The final capacity-sized image; unwritten bytes carry the pad byte.
    pub fn image(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rom() -> Bank {
        Bank::new("prg", BankKind::Rom, Some(0x8000), 0x100, 0xFF)
    }

    #[test]
    fn reserve_advances_and_checks_capacity() {
        let mut bank = rom();
        assert_eq!(bank.reserve("code", 0xF0).expect("fits"), 0);
        assert_eq!(bank.relative_position(), 0xF0);
        let err = bank.reserve("code", 0x20).expect_err("overflow");
        assert!(matches!(err, StorageError::OutOfSpace { remaining: 0x10, .. }));
    }

    #[test]
    fn absolute_seek_requires_origin_range() {
        let mut bank = rom();
        bank.absolute_seek(0x8040).expect("in range");
        assert_eq!(bank.relative_position(), 0x40);
        assert!(bank.absolute_seek(0x7FFF).is_err());
        assert!(bank.absolute_seek(0x8100).is_err());
    }

    #[test]
    fn overlapping_reservations_are_rejected_on_first_pass() {
        let mut bank = rom();
        bank.reserve("var 'first'", 4).expect("reserve");
        bank.absolute_seek(0x8002).expect("seek");
        let err = bank.reserve("var 'second'", 4).expect_err("overlap");
        assert!(matches!(err, StorageError::Overlap { offset: 2, .. }));
    }

    #[test]
    fn rewind_allows_rewriting_reserved_regions() {
        let mut bank = rom();
        bank.reserve("code", 2).expect("reserve");
        bank.rewind();
        assert_eq!(bank.relative_position(), 0);
        bank.write("code", &[0xA9, 0x01]).expect("write");
        assert_eq!(&bank.image()[..3], &[0xA9, 0x01, 0xFF]);
    }

    #[test]
    fn ram_banks_reject_writes() {
        let mut bank = Bank::new("zp", BankKind::Ram, Some(0), 0x100, 0);
        assert!(bank.reserve("var 'x'", 1).is_ok());
        assert!(matches!(
            bank.write("var 'x'", &[0]),
            Err(StorageError::NotStored { .. })
        ));
    }

    #[test]
    fn unwritten_bytes_carry_the_pad_byte() {
        let mut bank = rom();
        bank.write("header", &[0x01]).expect("write");
        assert_eq!(bank.image()[0], 0x01);
        assert!(bank.image()[1..].iter().all(|byte| *byte == 0xFF));
    }
}
