//! ANSI and IBM standard tape labels
//!
//! Volumes on tape may carry standard labels in front of the product's own
//! volume label so that generic tape software can identify them: a VOL1
//! record, HDR1 and HDR2, then a file mark. IBM labels are the same records
//! in EBCDIC. Non-tape devices never carry them.

pub mod ebcdic;
pub mod record;

use crate::device::{Device, DeviceError, DeviceResult, ErrorKind};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};

pub use record::{
    LabelClass, LabelRecord, DATA_STREAM_NAME, LEGACY_DATA_STREAM_NAME, RECORD_LEN,
    VOLUME_NAME_LEN,
};

/// At most VOL1, HDR1, HDR2 and three further HDRn records
const MAX_LABEL_RECORDS: usize = 6;

/// Kind of label written in front of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelType {
    /// The product's own label only
    #[serde(alias = "native")]
    Bareos,
    Ansi,
    Ibm,
}

/// Which header set a write produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelPurpose {
    /// Start of a volume: VOL1, HDR1, HDR2
    Volume,
    /// After the data: EOF1, EOF2
    EndOfFile,
    /// Volume continued elsewhere: EOV1, EOV2
    EndOfVolume,
}

impl LabelPurpose {
    fn class(self) -> LabelClass {
        match self {
            LabelPurpose::Volume => LabelClass::Header,
            LabelPurpose::EndOfFile => LabelClass::EndOfFile,
            LabelPurpose::EndOfVolume => LabelClass::EndOfVolume,
        }
    }
}

/// Identity found in a VOL1 record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeLabel {
    pub label_type: LabelType,
    pub volume_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LabelReadOutcome {
    /// Not a tape; nothing was read
    NotTape,
    /// No VOL1 in either encoding
    NoLabel,
    Verified(VolumeLabel),
}

/// Compare a requested volume name with a 6-byte label field.
///
/// Trailing blanks and NULs are equivalent; names longer than the field
/// never match.
pub fn same_label_names(requested: &str, field: &[u8]) -> bool {
    let requested = requested.as_bytes();
    if requested.len() > field.len() {
        return false;
    }
    let normalize = |b: u8| if b == 0 { b' ' } else { b };
    field
        .iter()
        .enumerate()
        .all(|(i, &b)| normalize(b) == requested.get(i).copied().unwrap_or(b' '))
}

/// Reads and writes standard labels over any device
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelCodec {
    /// Accept and write the legacy data-stream name
    compatible: bool,
    /// Label type forced by the device configuration
    forced: Option<LabelType>,
}

impl LabelCodec {
    pub fn new(compatible: bool) -> Self {
        Self {
            compatible,
            forced: None,
        }
    }

    pub fn with_forced_type(mut self, forced: Option<LabelType>) -> Self {
        self.forced = forced;
        self
    }

    /// The device's forced type wins over the requested one.
    pub fn effective_label_type(&self, requested: LabelType) -> LabelType {
        self.forced.unwrap_or(requested)
    }

    fn data_stream_name(&self) -> &'static str {
        if self.compatible {
            LEGACY_DATA_STREAM_NAME
        } else {
            DATA_STREAM_NAME
        }
    }

    /// Read and verify the labels at the current position.
    ///
    /// `requested` is the expected volume name; empty or `*` accepts any.
    pub fn read_label(
        &self,
        dev: &mut dyn Device,
        requested: &str,
    ) -> DeviceResult<LabelReadOutcome> {
        if !dev.is_tape() {
            log::debug!("{}: not a tape, no standard labels", dev.name());
            return Ok(LabelReadOutcome::NotTape);
        }
        let volume = dev.volume_name().unwrap_or(dev.name()).to_string();
        let label_error = |detail: &str| DeviceError::Label {
            volume: volume.clone(),
            detail: detail.to_string(),
        };

        let mut buf = [0u8; RECORD_LEN];
        let n = dev.read(&mut buf)?;
        if n == 0 {
            log::debug!("volume \"{}\": empty, no VOL1", volume);
            return Ok(LabelReadOutcome::NoLabel);
        }
        if n < RECORD_LEN {
            return Err(DeviceError::Io {
                volume: volume.clone(),
                context: format!("short VOL1 read of {} bytes", n),
                source: std::io::Error::from_raw_os_error(libc::EIO),
            });
        }

        let raw = LabelRecord::from_bytes(buf);
        // an EBCDIC VOL1 is only recognisable by converting and comparing again
        let (label_type, vol1) = if raw.tag() == b"VOL1" {
            (LabelType::Ansi, raw)
        } else if raw.to_ascii().tag() == b"VOL1" {
            (LabelType::Ibm, raw.to_ascii())
        } else {
            log::debug!("volume \"{}\": no ANSI or IBM label", volume);
            return Ok(LabelReadOutcome::NoLabel);
        };

        let found = vol1.vol1_name_trimmed();
        if !requested.is_empty()
            && requested != "*"
            && !same_label_names(requested, vol1.vol1_name())
        {
            return Err(DeviceError::LabelNameMismatch {
                requested: requested.to_string(),
                found,
            });
        }

        let hdr1 = self
            .next_record(dev, label_type, &volume)?
            .ok_or_else(|| label_error("HDR1 missing"))?;
        if hdr1.tag() != b"HDR1" {
            return Err(label_error("expected HDR1"));
        }
        let ours = hdr1.has_data_stream(DATA_STREAM_NAME)
            || (self.compatible && hdr1.has_data_stream(LEGACY_DATA_STREAM_NAME));
        if !ours {
            return Err(label_error("HDR1 data stream was not written by this product"));
        }

        let hdr2 = self
            .next_record(dev, label_type, &volume)?
            .ok_or_else(|| label_error("HDR2 missing"))?;
        if hdr2.tag() != b"HDR2" {
            return Err(label_error("expected HDR2"));
        }

        let mut count = 3;
        loop {
            match self.next_record(dev, label_type, &volume)? {
                None => break,
                Some(_) if count == MAX_LABEL_RECORDS => {
                    return Err(label_error("too many records"))
                }
                Some(record) if record.tag().starts_with(b"HDR") => count += 1,
                Some(record) => {
                    return Err(label_error(&format!(
                        "unexpected record {:?}",
                        String::from_utf8_lossy(record.tag())
                    )))
                }
            }
        }

        log::info!(
            "volume \"{}\": {:?} label for \"{}\" verified",
            volume,
            label_type,
            found
        );
        Ok(LabelReadOutcome::Verified(VolumeLabel {
            label_type,
            volume_name: found,
        }))
    }

    /// Next label record in ASCII; `None` at a file mark.
    ///
    /// A record shorter than `RECORD_LEN` is a label error.
    fn next_record(
        &self,
        dev: &mut dyn Device,
        label_type: LabelType,
        volume: &str,
    ) -> DeviceResult<Option<LabelRecord>> {
        let mut buf = [0u8; RECORD_LEN];
        let n = dev.read(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        if n < RECORD_LEN {
            return Err(DeviceError::Label {
                volume: volume.to_string(),
                detail: format!("short label record of {} bytes", n),
            });
        }
        let record = LabelRecord::from_bytes(buf);
        Ok(Some(match label_type {
            LabelType::Ibm => record.to_ascii(),
            _ => record,
        }))
    }

    /// Write the labels for `volume` followed by a file mark.
    ///
    /// Bareos labels write nothing. Running out of space while writing a
    /// header surfaces as `EndOfMedium`.
    pub fn write_labels(
        &self,
        dev: &mut dyn Device,
        requested: LabelType,
        purpose: LabelPurpose,
        volume: &str,
    ) -> DeviceResult<()> {
        let today = Local::now().date_naive();
        self.write_labels_dated(dev, requested, purpose, volume, today)
    }

    pub(crate) fn write_labels_dated(
        &self,
        dev: &mut dyn Device,
        requested: LabelType,
        purpose: LabelPurpose,
        volume: &str,
        today: NaiveDate,
    ) -> DeviceResult<()> {
        let label_type = self.effective_label_type(requested);
        if label_type == LabelType::Bareos {
            return Ok(());
        }
        if volume.is_empty() || volume.len() > VOLUME_NAME_LEN || !volume.is_ascii() {
            return Err(DeviceError::InvalidName {
                volume: volume.to_string(),
                detail: format!(
                    "{:?} labels need a volume name of 1 to {} ASCII characters",
                    label_type, VOLUME_NAME_LEN
                ),
            });
        }
        let name = format!("{:<width$}", volume, width = VOLUME_NAME_LEN);
        let class = purpose.class();

        if purpose == LabelPurpose::Volume {
            let vol1 = LabelRecord::vol1(&name, label_type).encode(label_type);
            match dev.write(vol1.as_bytes()) {
                Ok(RECORD_LEN) => {}
                Ok(n) => return Err(short_write(volume, "VOL1", n)),
                Err(e) if e.kind() == ErrorKind::EndOfMedium => {
                    return Err(DeviceError::Io {
                        volume: volume.to_string(),
                        context: format!("write VOL1: {}", e),
                        source: std::io::Error::from_raw_os_error(libc::ENOSPC),
                    })
                }
                Err(e) => return Err(e),
            }
        }

        let yesterday = today.pred_opt().unwrap_or(today);
        let hdr1 = LabelRecord::hdr1(class, &name, self.data_stream_name(), today, yesterday);
        write_header(dev, volume, hdr1.encode(label_type), "HDR1")?;

        let hdr2 = LabelRecord::hdr2(class, label_type);
        write_header(dev, volume, hdr2.encode(label_type), "HDR2")?;

        dev.weof(1)?;
        log::info!(
            "volume \"{}\": wrote {:?} {} labels",
            volume,
            label_type,
            class.tag()
        );
        Ok(())
    }
}

fn short_write(volume: &str, what: &str, n: usize) -> DeviceError {
    DeviceError::Io {
        volume: volume.to_string(),
        context: format!("short write of {} ({} of {} bytes)", what, n, RECORD_LEN),
        source: std::io::Error::from_raw_os_error(libc::EIO),
    }
}

/// A short header write means the medium is full.
fn write_header(
    dev: &mut dyn Device,
    volume: &str,
    record: LabelRecord,
    what: &str,
) -> DeviceResult<()> {
    match dev.write(record.as_bytes())? {
        RECORD_LEN => Ok(()),
        n => Err(DeviceError::EndOfMedium {
            volume: volume.to_string(),
            detail: format!("{} written short ({} of {} bytes)", what, n, RECORD_LEN),
        }),
    }
}
