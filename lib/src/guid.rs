use std::fmt::{Debug, Display, Formatter};
use std::io::{Read, Seek, Write};
use std::str::FromStr;

use binrw::{BinRead, BinResult, BinWrite, Endian};

/// 16-byte identifier used by chunks and EBX instances.
///
/// The first three fields follow the owning file's endianness; the last
/// 8 bytes are always big-endian.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Guid {
    pub val: (u32, u16, u16, u64),
}

impl Guid {
    pub const NULL: Guid = Guid { val: (0, 0, 0, 0) };

    pub fn is_null(&self) -> bool {
        self.val == (0, 0, 0, 0)
    }

    /// The least significant bit of the whole GUID flags a zlib-framed
    /// chunk payload.
    pub fn is_chunk_compressed(&self) -> bool {
        self.val.3 & 1 == 1
    }

    pub fn format(&self) -> String {
        format!(
            "{:08x}-{:04x}-{:04x}-{:04x}-{:010x}",
            self.val.0,
            self.val.1,
            self.val.2,
            (self.val.3 >> 48) & 0xFFFF,
            self.val.3 & 0x00FF_FFFF_FFFF
        )
    }

    /// Lossless rendering for the persisted GUID table. [`Guid::format`]
    /// masks the tail to 40 bits (it only has to be stable for
    /// filenames); this form round-trips every bit through [`FromStr`].
    pub fn full_format(&self) -> String {
        format!(
            "{:08x}-{:04x}-{:04x}-{:016x}",
            self.val.0, self.val.1, self.val.2, self.val.3
        )
    }
}

impl Default for Guid {
    fn default() -> Self {
        Self::NULL
    }
}

impl BinRead for Guid {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        _: Self::Args<'_>,
    ) -> BinResult<Self> {
        let a = u32::read_options(reader, endian, ())?;
        let b = u16::read_options(reader, endian, ())?;
        let c = u16::read_options(reader, endian, ())?;
        let d = u64::read_options(reader, Endian::Big, ())?;
        Ok(Self { val: (a, b, c, d) })
    }
}

impl BinWrite for Guid {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        endian: Endian,
        _: Self::Args<'_>,
    ) -> BinResult<()> {
        self.val.0.write_options(writer, endian, ())?;
        self.val.1.write_options(writer, endian, ())?;
        self.val.2.write_options(writer, endian, ())?;
        self.val.3.write_options(writer, Endian::Big, ())?;
        Ok(())
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

impl Debug for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

impl FromStr for Guid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |_| format!("Not a GUID: {s}");
        let parts: Vec<&str> = s.split('-').collect();
        match parts.as_slice() {
            // Lossless four-group form, see full_format.
            [a, b, c, tail] => Ok(Self {
                val: (
                    u32::from_str_radix(a, 16).map_err(bad)?,
                    u16::from_str_radix(b, 16).map_err(bad)?,
                    u16::from_str_radix(c, 16).map_err(bad)?,
                    u64::from_str_radix(tail, 16).map_err(bad)?,
                ),
            }),
            // Display form with the 40-bit tail.
            [a, b, c, d, e] => {
                let d = u16::from_str_radix(d, 16).map_err(bad)?;
                let e = u64::from_str_radix(e, 16).map_err(bad)?;
                Ok(Self {
                    val: (
                        u32::from_str_radix(a, 16).map_err(bad)?,
                        u16::from_str_radix(b, 16).map_err(bad)?,
                        u16::from_str_radix(c, 16).map_err(bad)?,
                        (u64::from(d) << 48) | e,
                    ),
                })
            }
            _ => Err(format!("Not a GUID: {s}")),
        }
    }
}

/// Raw 20-byte SHA-1 digest as stored in catalogs and bundle metadata.
/// Never recomputed or verified, only compared.
#[derive(BinRead, BinWrite, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Sha1(pub [u8; 20]);

impl Display for Sha1 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Sha1 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

#[cfg(test)]
mod guid_tests {
    use std::io::Cursor;

    use binrw::{BinRead, BinWrite, Endian};

    use super::Guid;

    const SAMPLE: Guid = Guid {
        val: (0x01020304, 0x0506, 0x0708, 0x1122004455667788),
    };

    #[test]
    fn endianness_symmetry() {
        let mut le = Cursor::new(Vec::new());
        SAMPLE.write_options(&mut le, Endian::Little, ()).unwrap();
        let mut be = Cursor::new(Vec::new());
        SAMPLE.write_options(&mut be, Endian::Big, ()).unwrap();
        assert_ne!(le.get_ref(), be.get_ref());

        le.set_position(0);
        be.set_position(0);
        let from_le = Guid::read_options(&mut le, Endian::Little, ()).unwrap();
        let from_be = Guid::read_options(&mut be, Endian::Big, ()).unwrap();
        assert_eq!(from_le, from_be);
        assert_eq!(from_le.format(), from_be.format());
    }

    #[test]
    fn last_eight_bytes_always_big_endian() {
        let raw = [
            0x04, 0x03, 0x02, 0x01, // u32, little
            0x06, 0x05, // u16, little
            0x08, 0x07, // u16, little
            0x11, 0x22, 0x00, 0x44, 0x55, 0x66, 0x77, 0x88, // u64, big
        ];
        let guid = Guid::read_options(&mut Cursor::new(raw), Endian::Little, ()).unwrap();
        assert_eq!(guid, SAMPLE);
    }

    #[test]
    fn format_splits_tail() {
        assert_eq!(
            SAMPLE.format(),
            "01020304-0506-0708-1122-4455667788".to_string()
        );
    }

    #[test]
    fn format_round_trips_through_parse() {
        let parsed: Guid = SAMPLE.format().parse().unwrap();
        assert_eq!(parsed, SAMPLE);
        assert!("not-a-guid".parse::<Guid>().is_err());
    }

    #[test]
    fn full_format_round_trips_every_bit() {
        let guid = Guid {
            val: (1, 2, 3, 0x1122334455667788),
        };
        // The display form drops tail bits 40..48; the table form keeps
        // them.
        assert_ne!(guid.format(), guid.full_format());
        let parsed: Guid = guid.full_format().parse().unwrap();
        assert_eq!(parsed, guid);
    }

    #[test]
    fn chunk_compressed_bit() {
        let mut guid = SAMPLE;
        assert_eq!(guid.val.3 & 1, 0);
        assert!(!guid.is_chunk_compressed());
        guid.val.3 |= 1;
        assert!(guid.is_chunk_compressed());
    }

    #[test]
    fn null_guid() {
        assert!(Guid::NULL.is_null());
        assert!(!SAMPLE.is_null());
    }
}
