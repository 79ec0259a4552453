//! Memory and catalog manager.
//!
//! Residency is decided from the channel's volatile-memory catalog by plain
//! substring containment: a name counts as resident if it appears anywhere in
//! the listing. Names that are substrings of other resident names therefore
//! match too. Both the volatile listing and the stored-waveform listing are
//! read under an input buffer widened to the catalog capacity, since either
//! can be far longer than the default read capacity.

use crate::buffer::with_buffer;
use crate::channel::Channel;
use crate::commands::{self, Attribute};
use crate::error::{AppResult, FgenError};
use crate::transport::{BufferDirection, Transport};
use crate::waveform::decode_catalog;
use std::collections::BTreeSet;

/// Raw volatile-memory catalog of `channel`, read with the input buffer
/// widened to `catalog_bytes`.
async fn volatile_listing<T: Transport>(
    transport: &mut T,
    channel: Channel,
    catalog_bytes: usize,
) -> AppResult<String> {
    let query = commands::volatile_catalog_query(channel);
    with_buffer(transport, BufferDirection::Input, catalog_bytes, move |t| {
        Box::pin(async move { t.query(&query).await })
    })
    .await
}

/// Whether `name` (a volatile name or a storage path) is resident on `channel`.
pub async fn check_memory<T: Transport>(
    transport: &mut T,
    channel: Channel,
    name: &str,
    catalog_bytes: usize,
) -> AppResult<bool> {
    let listing = volatile_listing(transport, channel, catalog_bytes).await?;
    let resident = listing.contains(name);
    tracing::debug!(%channel, name, resident, "Volatile memory lookup");
    Ok(resident)
}

/// Names held in a channel's volatile memory, in catalog order.
pub async fn resident_waveforms<T: Transport>(
    transport: &mut T,
    channel: Channel,
    catalog_bytes: usize,
) -> AppResult<Vec<String>> {
    let listing = volatile_listing(transport, channel, catalog_bytes).await?;
    Ok(parse_volatile_listing(&listing))
}

/// Split a `"a","b"` volatile catalog response into names.
pub fn parse_volatile_listing(listing: &str) -> Vec<String> {
    listing
        .split(',')
        .map(|entry| entry.trim().trim_matches('"'))
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Names of the stored waveforms in `folder_path` (e.g. `INT:\stim`).
///
/// The listing is read with the input buffer widened to `catalog_bytes`.
pub async fn list_waveforms<T: Transport>(
    transport: &mut T,
    folder_path: &str,
    extension: &str,
    catalog_bytes: usize,
) -> AppResult<BTreeSet<String>> {
    let query = commands::catalog_query(folder_path);
    let listing = with_buffer(transport, BufferDirection::Input, catalog_bytes, move |t| {
        Box::pin(async move { t.query(&query).await })
    })
    .await?;

    let names = decode_catalog(&listing, extension);
    tracing::debug!(folder = folder_path, count = names.len(), "Listed stored waveforms");
    Ok(names)
}

/// Query a waveform attribute.
///
/// Returns `Ok(None)` with a warning when `name` is not resident on
/// `channel`; the waveform has to be loaded first. Residency is checked
/// against the volatile catalog read at `catalog_bytes`.
///
/// # Errors
/// Transport failures, or `FgenError::UnexpectedResponse` if the instrument
/// answers with something that is not a number.
pub async fn query_attribute<T: Transport>(
    transport: &mut T,
    channel: Channel,
    name: &str,
    attribute: Attribute,
    catalog_bytes: usize,
) -> AppResult<Option<f64>> {
    if !check_memory(transport, channel, name, catalog_bytes).await? {
        tracing::warn!(
            %channel,
            name,
            "Waveform not in volatile memory; load it before querying its {}",
            attribute
        );
        return Ok(None);
    }

    let query = attribute.query(channel, name);
    let response = transport.query(&query).await?;
    let value = response
        .trim()
        .parse::<f64>()
        .map_err(|_| FgenError::UnexpectedResponse {
            query,
            response: response.clone(),
        })?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockFunctionGenerator;
    use tracing_test::traced_test;

    const CATALOG_BYTES: usize = 64 * 1024;

    async fn upload(mock: &mut MockFunctionGenerator, channel: u8, name: &str) {
        mock.write(&format!(
            "SOUR{}:DATA:ARB:DAC {},0,4000,8000,12000,8000,4000,0,-4000",
            channel, name
        ))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn residency_is_substring_containment() {
        let mut mock = MockFunctionGenerator::new();
        upload(&mut mock, 1, "ramp_long").await;

        assert!(check_memory(&mut mock, Channel::One, "ramp_long", CATALOG_BYTES).await.unwrap());
        // Substring of a resident name also matches
        assert!(check_memory(&mut mock, Channel::One, "ramp", CATALOG_BYTES).await.unwrap());
        assert!(!check_memory(&mut mock, Channel::One, "sine", CATALOG_BYTES).await.unwrap());
        assert!(!check_memory(&mut mock, Channel::Two, "ramp", CATALOG_BYTES).await.unwrap());
    }

    #[tokio::test]
    async fn volatile_listing_is_parsed() {
        let mut mock = MockFunctionGenerator::new();
        assert!(resident_waveforms(&mut mock, Channel::Two, CATALOG_BYTES).await.unwrap().is_empty());

        upload(&mut mock, 2, "a").await;
        upload(&mut mock, 2, "b").await;
        assert_eq!(
            resident_waveforms(&mut mock, Channel::Two, CATALOG_BYTES).await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[tokio::test]
    async fn long_listing_survives_the_default_buffer() {
        let mut mock = MockFunctionGenerator::with_capacity(64);
        let handle = mock.handle();
        for i in 0..20 {
            handle.store_file(&format!("INT:\\stim\\wave{:02}.arb", i), vec![0; 8]);
        }

        let names = list_waveforms(&mut mock, "INT:\\stim", "arb", 8192).await.unwrap();
        assert_eq!(names.len(), 20);
        assert!(names.contains("wave19"));
        assert_eq!(mock.buffer_capacity(BufferDirection::Input), 64);
        assert_eq!(handle.active_capacity(BufferDirection::Input), 64);
    }

    #[tokio::test]
    async fn long_volatile_listing_survives_the_default_buffer() {
        let mut mock = MockFunctionGenerator::with_capacity(512);
        let handle = mock.handle();
        for i in 0..40 {
            upload(&mut mock, 1, &format!("stimulus{:04}", i)).await;
        }

        let names = resident_waveforms(&mut mock, Channel::One, CATALOG_BYTES)
            .await
            .unwrap();
        assert_eq!(names.len(), 40);
        assert!(check_memory(&mut mock, Channel::One, "stimulus0039", CATALOG_BYTES)
            .await
            .unwrap());
        let ptp = query_attribute(
            &mut mock,
            Channel::One,
            "stimulus0039",
            Attribute::PeakToPeak,
            CATALOG_BYTES,
        )
        .await
        .unwrap();
        assert!(ptp.is_some());
        assert_eq!(handle.active_capacity(BufferDirection::Input), 512);
    }

    #[tokio::test]
    #[traced_test]
    async fn absent_waveform_attribute_is_soft() {
        let mut mock = MockFunctionGenerator::new();
        let value = query_attribute(&mut mock, Channel::One, "ghost", Attribute::CrestFactor, CATALOG_BYTES)
            .await
            .unwrap();
        assert_eq!(value, None);
        assert!(logs_contain("load it before querying"));
        assert_eq!(mock.handle().pending_errors(), 0);
    }

    #[tokio::test]
    async fn resident_waveform_attributes() {
        let mut mock = MockFunctionGenerator::new();
        upload(&mut mock, 1, "tri").await;

        let ptp = query_attribute(&mut mock, Channel::One, "tri", Attribute::PeakToPeak, CATALOG_BYTES)
            .await
            .unwrap()
            .unwrap();
        assert!((ptp - 16000.0 / 32767.0).abs() < 1e-5);

        let crest = query_attribute(&mut mock, Channel::One, "tri", Attribute::CrestFactor, CATALOG_BYTES)
            .await
            .unwrap()
            .unwrap();
        assert!(crest > 1.0);
    }
}
