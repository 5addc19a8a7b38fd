use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

pub fn verify_ed25519_signature_hex(
    payload: &[u8],
    public_key_hex: &str,
    signature_hex: &str,
) -> Result<bool> {
    let key_bytes = decode_fixed::<32>(public_key_hex.trim(), "public key")?;
    let signature_bytes = decode_fixed::<64>(signature_hex.trim(), "signature")?;

    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).context("invalid Ed25519 public key bytes")?;
    let signature = Signature::from_bytes(&signature_bytes);

    Ok(verifying_key.verify(payload, &signature).is_ok())
}

/// Like [`verify_ed25519_signature_hex`] but treats a mismatch as an error
/// naming `subject`.
pub fn require_valid_signature(
    subject: &str,
    payload: &[u8],
    public_key_hex: &str,
    signature_hex: &str,
) -> Result<()> {
    let valid = verify_ed25519_signature_hex(payload, public_key_hex, signature_hex)
        .with_context(|| format!("failed to verify signature for {subject}"))?;
    if !valid {
        return Err(anyhow!("signature verification failed for {subject}"));
    }
    Ok(())
}

fn decode_fixed<const N: usize>(value: &str, what: &str) -> Result<[u8; N]> {
    let bytes =
        hex::decode(value).with_context(|| format!("failed to decode Ed25519 {what} hex"))?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| {
        anyhow!("invalid Ed25519 {what} length: expected {N} bytes, got {len}")
    })
}
