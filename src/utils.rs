//! Utility functions for identifiers, record encoding and storage keys

use bech32::Bech32m;
use uuid7::uuid7;

use crate::error::EngineError;
use crate::types::LicenseId;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

pub fn new_license_id() -> Result<LicenseId, EngineError> {
    Ok(LicenseId::new(new_uuid_to_bech32("lic")?))
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, EngineError> {
    minicbor::to_vec(value).map_err(|e| EngineError::Corrupt(e.to_string()))
}

pub(crate) fn decode<T>(bytes: &[u8]) -> Result<T, EngineError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}

/// Key prefix shared by every per-license sequenced record: `<license_id>/`
pub(crate) fn license_prefix(license_id: &LicenseId) -> Vec<u8> {
    let mut key = Vec::with_capacity(license_id.as_str().len() + 1);
    key.extend_from_slice(license_id.as_str().as_bytes());
    key.push(b'/');
    key
}

/// `<license_id>/<seq as big-endian u64>` so a prefix scan yields sequence order
pub(crate) fn sequenced_key(license_id: &LicenseId, seq: u64) -> Vec<u8> {
    let mut key = license_prefix(license_id);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequenced_keys_sort_by_sequence() {
        let id = LicenseId::from("lic1abc");
        let keys: Vec<Vec<u8>> = [1u64, 2, 255, 256, 70_000]
            .iter()
            .map(|seq| sequenced_key(&id, *seq))
            .collect();

        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(keys.iter().all(|k| k.starts_with(&license_prefix(&id))));
    }

    #[test]
    fn license_ids_use_lic_prefix() {
        let id = new_license_id().unwrap();
        assert!(id.as_str().starts_with("lic1"));
        assert_ne!(id, new_license_id().unwrap());
    }
}
