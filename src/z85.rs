//! Z85 text codec, used for sideband tunneling of binary tokens through
//! text-only channels (info pings, MOTD payloads). Padding-aware: unlike
//! the canonical ZeroMQ Z85, this variant accepts byte strings whose length
//! is not a multiple of 4 by padding with zero bytes before encoding and
//! recording the true length so decode can trim the padding back off.

const ALPHABET: &[u8; 85] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ.-:+=^!/*?&<>()[]{}@%$#";

fn decode_table() -> [i8; 256] {
    let mut table = [-1i8; 256];
    for (i, &b) in ALPHABET.iter().enumerate() {
        table[b as usize] = i as i8;
    }
    table
}

/// Encode arbitrary bytes to a Z85 string. A one-byte length-remainder
/// prefix (`0..=3`) records how many padding zero bytes were appended so
/// [`decode`] can recover the exact original length.
pub fn encode(data: &[u8]) -> String {
    let pad = (4 - data.len() % 4) % 4;
    let mut padded = Vec::with_capacity(data.len() + pad);
    padded.extend_from_slice(data);
    padded.resize(data.len() + pad, 0);

    let mut out = String::with_capacity(1 + padded.len() * 5 / 4);
    out.push((b'0' + pad as u8) as char);
    for chunk in padded.chunks_exact(4) {
        let mut value = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as u64;
        let mut chars = [0u8; 5];
        for i in (0..5).rev() {
            chars[i] = ALPHABET[(value % 85) as usize];
            value /= 85;
        }
        out.push_str(std::str::from_utf8(&chars).unwrap());
    }
    out
}

/// Decode a string produced by [`encode`] back to the original bytes.
pub fn decode(s: &str) -> Option<Vec<u8>> {
    let bytes = s.as_bytes();
    if bytes.is_empty() {
        return None;
    }
    let pad = (bytes[0] as char).to_digit(10)? as usize;
    if pad > 3 {
        return None;
    }
    let body = &bytes[1..];
    if !body.len().is_multiple_of(5) {
        return None;
    }
    let table = decode_table();
    let mut out = Vec::with_capacity(body.len() / 5 * 4);
    for chunk in body.chunks_exact(5) {
        let mut value: u64 = 0;
        for &c in chunk {
            let digit = table[c as usize];
            if digit < 0 {
                return None;
            }
            value = value * 85 + digit as u64;
        }
        if value > u32::MAX as u64 {
            return None;
        }
        out.extend_from_slice(&(value as u32).to_be_bytes());
    }
    out.truncate(out.len().saturating_sub(pad));
    Some(out)
}
