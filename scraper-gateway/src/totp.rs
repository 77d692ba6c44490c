use anyhow::{anyhow, Result};
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

const TOTP_PERIOD: u64 = 30;
const TOTP_DIGITS: u32 = 6;

/// Standard 6-digit TOTP over a base32 (no padding) secret, as the
/// upstream's two-factor challenge expects.
pub fn generate_code(secret: &str) -> Result<String> {
    let normalized = secret.trim().replace(' ', "").to_ascii_uppercase();
    let trimmed = normalized.trim_end_matches('=');
    let secret_bytes = BASE32_NOPAD
        .decode(trimmed.as_bytes())
        .map_err(|_| anyhow!("two-factor secret is not valid base32"))?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| anyhow!("system clock before unix epoch"))?
        .as_secs();
    let code = hotp(&secret_bytes, now / TOTP_PERIOD);
    Ok(format!("{:0width$}", code, width = TOTP_DIGITS as usize))
}

fn hotp(secret: &[u8], counter: u64) -> u32 {
    let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(&counter.to_be_bytes());
    let result = mac.finalize().into_bytes();

    let offset = (result[result.len() - 1] & 0x0f) as usize;
    let code = ((result[offset] as u32 & 0x7f) << 24)
        | ((result[offset + 1] as u32) << 16)
        | ((result[offset + 2] as u32) << 8)
        | (result[offset + 3] as u32);

    code % 10u32.pow(TOTP_DIGITS)
}
