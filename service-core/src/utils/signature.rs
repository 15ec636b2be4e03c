use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Compute an HMAC-SHA256 tag over the concatenation of `parts`, hex-encoded.
///
/// Taking the message as parts lets callers sign composite payloads
/// (e.g. `timestamp + "." + raw_body`) without copying the body.
pub fn hmac_sha256_hex(secret: &[u8], parts: &[&[u8]]) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;

    for part in parts {
        mac.update(part);
    }

    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time equality for secrets and signature tags.
///
/// Length is compared first; a length mismatch leaks nothing useful since
/// the expected tag length is public.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
