//! Small encoding helpers shared by the overlay and provisioning code.

/// Length in bytes of a Curve25519 public key as used by `WireGuard`.
pub const PEER_KEY_LEN: usize = 32;

/// Decode standard (padded or unpadded) base64.
#[allow(clippy::cast_possible_truncation)]
pub fn base64_decode(input: &str) -> Result<Vec<u8>, String> {
    const DECODE: [u8; 128] = {
        let mut table = [255u8; 128];
        let chars = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
        let mut i = 0;
        while i < 64 {
            table[chars[i] as usize] = i as u8;
            i += 1;
        }
        table
    };

    let input = input.trim_end_matches('=');
    if input.len() % 4 == 1 {
        return Err("invalid base64 length".to_string());
    }
    let mut out = Vec::with_capacity(input.len() * 3 / 4);

    for chunk in input.as_bytes().chunks(4) {
        let mut n: u32 = 0;
        for (i, &b) in chunk.iter().enumerate() {
            let idx = b as usize;
            if idx >= DECODE.len() || DECODE[idx] == 255 {
                return Err(format!("invalid base64 character: {}", b as char));
            }
            n |= u32::from(DECODE[idx]) << (18 - i * 6);
        }

        out.push((n >> 16 & 0xFF) as u8);
        if chunk.len() > 2 {
            out.push((n >> 8 & 0xFF) as u8);
        }
        if chunk.len() > 3 {
            out.push((n & 0xFF) as u8);
        }
    }

    Ok(out)
}

/// Returns true when `key` is a base64 string decoding to exactly 32 bytes.
pub fn is_peer_key(key: &str) -> bool {
    let key = key.trim();
    key.len() == 44 && base64_decode(key).is_ok_and(|bytes| bytes.len() == PEER_KEY_LEN)
}
