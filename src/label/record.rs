//! 80-byte label records
//!
//! ```text
//! VOL1  0-3 tag | 4-9 volume | 10 access | 37-50 owner (ANSI) | 79 level
//! HDR1  0-3 tag | 4-20 data stream | 21-26 volume | 27-30 sequence
//!       31-34 file number | 35-38 generation | 39-40 generation version
//!       41-46 created | 47-52 expires | 53 access | 54-59 block count
//!       60-72 software | 73-79 reserved
//! HDR2  0-3 tag | 4 record format | 5-9 block length | 10-14 record length
//! ```

use super::{ebcdic, LabelType};
use chrono::{Datelike, NaiveDate};

pub const RECORD_LEN: usize = 80;

/// Longest volume name an ANSI or IBM label can carry
pub const VOLUME_NAME_LEN: usize = 6;

/// Data-stream name written into HDR1
pub const DATA_STREAM_NAME: &str = "BAREOS.DATA";

/// Data-stream name of labels written by the predecessor product
pub const LEGACY_DATA_STREAM_NAME: &str = "BACULA.DATA";

/// Software name written into HDR1
pub const SOFTWARE_NAME: &str = "STORDEV";

const DATA_STREAM: usize = 4;
const DATA_STREAM_LEN: usize = 17;
const VOLUME: usize = 4;
const HDR1_VOLUME: usize = 21;
const CREATED: usize = 41;
const EXPIRES: usize = 47;
const BLOCK_COUNT: usize = 54;
const SOFTWARE: usize = 60;
const SOFTWARE_LEN: usize = 13;
const LABEL_LEVEL: usize = 79;

/// Header class: the first three bytes of HDR1/HDR2 style records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelClass {
    Header,
    EndOfFile,
    EndOfVolume,
}

impl LabelClass {
    pub fn tag(self) -> &'static str {
        match self {
            LabelClass::Header => "HDR",
            LabelClass::EndOfFile => "EOF",
            LabelClass::EndOfVolume => "EOV",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LabelRecord([u8; RECORD_LEN]);

impl std::fmt::Debug for LabelRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LabelRecord({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl LabelRecord {
    /// All-blank record
    pub fn blank() -> Self {
        Self([b' '; RECORD_LEN])
    }

    pub fn from_bytes(bytes: [u8; RECORD_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; RECORD_LEN] {
        &self.0
    }

    pub fn tag(&self) -> &[u8] {
        &self.0[..4]
    }

    /// Volume name field of a VOL1 record
    pub fn vol1_name(&self) -> &[u8] {
        &self.0[VOLUME..VOLUME + VOLUME_NAME_LEN]
    }

    /// Volume name with trailing blanks and NULs removed
    pub fn vol1_name_trimmed(&self) -> String {
        let name = self.vol1_name();
        let end = name
            .iter()
            .rposition(|&b| b != b' ' && b != 0)
            .map_or(0, |i| i + 1);
        String::from_utf8_lossy(&name[..end]).into_owned()
    }

    /// Whether HDR1's data-stream field starts with `name`
    pub fn has_data_stream(&self, name: &str) -> bool {
        self.0[DATA_STREAM..DATA_STREAM + name.len()] == *name.as_bytes()
    }

    pub fn to_ebcdic(mut self) -> Self {
        ebcdic::to_ebcdic(&mut self.0);
        self
    }

    pub fn to_ascii(mut self) -> Self {
        ebcdic::to_ascii(&mut self.0);
        self
    }

    /// Wire form for the given label type
    pub fn encode(self, label_type: LabelType) -> Self {
        match label_type {
            LabelType::Ibm => self.to_ebcdic(),
            _ => self,
        }
    }

    fn put(&mut self, offset: usize, text: &[u8]) {
        self.0[offset..offset + text.len()].copy_from_slice(text);
    }

    /// Write `text` blank padded (or cut) to `len` bytes
    fn put_padded(&mut self, offset: usize, len: usize, text: &str) {
        let bytes = text.as_bytes();
        let n = bytes.len().min(len);
        self.put(offset, &bytes[..n]);
        self.0[offset + n..offset + len].fill(b' ');
    }

    /// VOL1 for a blank-padded six character name
    pub fn vol1(name: &str, label_type: LabelType) -> Self {
        let mut record = Self::blank();
        record.put(0, b"VOL1");
        record.put_padded(VOLUME, VOLUME_NAME_LEN, name);
        if label_type == LabelType::Ansi {
            record.0[LABEL_LEVEL] = b'3';
        }
        record
    }

    pub fn hdr1(
        class: LabelClass,
        name: &str,
        data_stream: &str,
        created: NaiveDate,
        expires: NaiveDate,
    ) -> Self {
        let mut record = Self::blank();
        record.put(0, class.tag().as_bytes());
        record.put(3, b"1");
        record.put_padded(DATA_STREAM, DATA_STREAM_LEN, data_stream);
        record.put_padded(HDR1_VOLUME, VOLUME_NAME_LEN, name);
        // volume sequence, file number, generation, generation version
        record.put(27, b"00010001000100");
        record.put(CREATED, &ansi_date(created));
        record.put(EXPIRES, &ansi_date(expires));
        record.put(BLOCK_COUNT, b"000000");
        record.put_padded(SOFTWARE, SOFTWARE_LEN, SOFTWARE_NAME);
        record
    }

    pub fn hdr2(class: LabelClass, label_type: LabelType) -> Self {
        let mut record = Self::blank();
        record.put(0, class.tag().as_bytes());
        record.put(3, b"2D3200032000");
        if label_type == LabelType::Ibm {
            record.0[4] = b'V';
        }
        record
    }
}

/// ` YYDDD`: blank, two-digit year since 2000, day of year
pub fn ansi_date(date: NaiveDate) -> [u8; 6] {
    let text = format!(
        " {:02}{:03}",
        (date.year() - 2000).rem_euclid(100),
        date.ordinal()
    );
    let mut out = [b' '; 6];
    out.copy_from_slice(text.as_bytes());
    out
}
