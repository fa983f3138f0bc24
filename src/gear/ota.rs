//! Firmware update plumbing.
//!
//! Updates are announced by the vendor as a small JSON document naming a
//! version, an MD5 checksum and a download URL. The payload is fetched
//! (or loaded from disk), verified, announced to the device as
//! `OTA <length> <md5>`, and then streamed in chunks. Each chunk goes out
//! only once the previous write has been acknowledged; the device reboots
//! when the upload completes, so success is inferred from the resulting
//! disconnect rather than from any reply.

use std::path::Path;

use md5::{Digest, Md5};
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

/// Bytes per firmware write. Sized to fit the gear's characteristic.
pub const FIRMWARE_CHUNK_SIZE: usize = 500;

/// How long to wait for the post-upload reboot disconnect before telling
/// the user to check the device themselves.
pub const REBOOT_FALLBACK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Errors returned by firmware update operations.
#[derive(Debug, Error)]
pub enum OtaError {
    #[error("failed to talk to the firmware server")]
    Http(#[from] reqwest::Error),
    #[error("firmware payload does not match its published checksum (expected {expected}, got {actual})")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("failed to read local firmware file")]
    LocalRead {
        #[source]
        source: std::io::Error,
    },
    #[error("this gear model has no firmware update path")]
    Unsupported,
    #[error("a firmware upload is already in flight")]
    AlreadyUpdating,
}

/// The vendor's firmware announcement document.
#[derive(Debug, Clone, Deserialize)]
pub struct FirmwareInfo {
    version: String,
    md5sum: String,
    url: String,
}

impl FirmwareInfo {
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn md5sum(&self) -> &str {
        &self.md5sum
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// A firmware payload whose checksum has been confirmed.
#[derive(Debug, Clone)]
pub struct VerifiedFirmware {
    data: Vec<u8>,
    md5: String,
}

impl VerifiedFirmware {
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn md5(&self) -> &str {
        &self.md5
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Fetches the firmware announcement document.
///
/// # Errors
///
/// Returns an error when the request fails or the document is malformed.
#[instrument(skip(client), level = "info")]
pub async fn fetch_firmware_info(
    client: &reqwest::Client,
    url: &str,
) -> Result<FirmwareInfo, OtaError> {
    let info = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json::<FirmwareInfo>()
        .await?;
    Ok(info)
}

/// Downloads the firmware payload and verifies it against the announced
/// checksum.
///
/// # Errors
///
/// Returns an error when the download fails or the checksum differs, in
/// which case nothing must be written to the device.
#[instrument(skip(client, info), level = "info", fields(url = %info.url(), version = %info.version()))]
pub async fn download_firmware(
    client: &reqwest::Client,
    info: &FirmwareInfo,
) -> Result<VerifiedFirmware, OtaError> {
    let payload = client
        .get(info.url())
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    verify_firmware(payload.to_vec(), info.md5sum())
}

/// Loads a locally supplied firmware file. The checksum is computed from
/// the file contents and carried through the same announcement path as a
/// downloaded payload.
///
/// # Errors
///
/// Returns an error when the file cannot be read.
pub fn load_local_firmware(path: &Path) -> Result<VerifiedFirmware, OtaError> {
    let data = std::fs::read(path).map_err(|source| OtaError::LocalRead { source })?;
    let md5 = md5_hex(&data);
    Ok(VerifiedFirmware { data, md5 })
}

/// Confirms a payload against an expected MD5 checksum.
///
/// # Errors
///
/// Returns `ChecksumMismatch` when the digests differ.
pub fn verify_firmware(data: Vec<u8>, expected_md5: &str) -> Result<VerifiedFirmware, OtaError> {
    let actual = md5_hex(&data);
    if !actual.eq_ignore_ascii_case(expected_md5) {
        return Err(OtaError::ChecksumMismatch {
            expected: expected_md5.to_string(),
            actual,
        });
    }
    Ok(VerifiedFirmware { data, md5: actual })
}

fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Chunk-at-a-time upload state.
///
/// The session drives this by sending the announcement, then requesting
/// the next chunk each time the previous write acknowledges.
#[derive(Debug)]
pub struct OtaUpload {
    firmware: VerifiedFirmware,
    sent: usize,
}

impl OtaUpload {
    #[must_use]
    pub fn new(firmware: VerifiedFirmware) -> Self {
        Self { firmware, sent: 0 }
    }

    /// The `OTA <length> <md5>` initiator message.
    #[must_use]
    pub fn announcement(&self) -> String {
        format!("OTA {} {}", self.firmware.len(), self.firmware.md5())
    }

    /// The next chunk to write, advancing the cursor. `None` once the
    /// whole payload has been handed out.
    pub fn next_chunk(&mut self) -> Option<Vec<u8>> {
        if self.sent >= self.firmware.len() {
            return None;
        }
        let end = (self.sent + FIRMWARE_CHUNK_SIZE).min(self.firmware.len());
        let chunk = self.firmware.data()[self.sent..end].to_vec();
        self.sent = end;
        Some(chunk)
    }

    /// Upload progress in percent. Starts at 1 so a progress bar moves
    /// as soon as the announcement goes out, and tops out at 99; the
    /// device disconnects to flash itself, so 100 is never shown before
    /// the reboot.
    #[must_use]
    pub fn progress_percent(&self) -> u8 {
        if self.firmware.is_empty() {
            return 99;
        }
        let scaled = 1 + 98 * self.sent / self.firmware.len();
        scaled as u8
    }

    #[must_use]
    pub fn bytes_sent(&self) -> usize {
        self.sent
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.sent >= self.firmware.len()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    fn firmware_of(size: usize) -> VerifiedFirmware {
        let data: Vec<u8> = (0..size).map(|index| (index % 251) as u8).collect();
        let md5 = md5_hex(&data);
        verify_firmware(data, &md5).expect("self-computed checksum should verify")
    }

    #[test]
    fn verification_rejects_a_tampered_payload() {
        let result = verify_firmware(b"firmware bytes".to_vec(), "00000000000000000000000000000000");

        assert_matches!(result, Err(OtaError::ChecksumMismatch { .. }));
    }

    #[test]
    fn verification_is_case_insensitive_on_the_expected_digest() {
        let data = b"firmware bytes".to_vec();
        let digest = md5_hex(&data).to_uppercase();

        assert!(verify_firmware(data, &digest).is_ok());
    }

    #[test]
    fn upload_hands_out_exactly_the_expected_chunks() {
        let mut upload = OtaUpload::new(firmware_of(10_000));
        let mut chunks = 0;
        while let Some(chunk) = upload.next_chunk() {
            assert_eq!(FIRMWARE_CHUNK_SIZE, chunk.len());
            chunks += 1;
        }

        assert_eq!(20, chunks);
        assert!(upload.is_complete());
        assert_eq!(10_000, upload.bytes_sent());
    }

    #[test]
    fn short_final_chunk_carries_the_remainder() {
        let mut upload = OtaUpload::new(firmware_of(1_250));
        let mut sizes = Vec::new();
        while let Some(chunk) = upload.next_chunk() {
            sizes.push(chunk.len());
        }

        assert_eq!(vec![500, 500, 250], sizes);
    }

    #[test]
    fn progress_starts_at_one_and_never_reaches_one_hundred() {
        let mut upload = OtaUpload::new(firmware_of(10_000));
        let mut last = upload.progress_percent();
        assert_eq!(1, last);

        while upload.next_chunk().is_some() {
            let progress = upload.progress_percent();
            assert!(progress >= last);
            assert!(progress <= 99);
            last = progress;
        }

        assert_eq!(99, last);
    }

    #[test]
    fn announcement_names_length_and_digest() {
        let firmware = firmware_of(1_000);
        let digest = firmware.md5().to_string();
        let upload = OtaUpload::new(firmware);

        assert_eq!(format!("OTA 1000 {digest}"), upload.announcement());
    }
}
