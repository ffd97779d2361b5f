use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Read buffer for streaming hashes; large enough that syscall overhead is
/// negligible next to MD5 itself.
const CHUNK: usize = 64 * 1024;

/// Lowercase hex MD5 of a file, streamed so large content never has to fit
/// in memory.
pub fn md5_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

/// Lowercase hex MD5 of an in-memory buffer.
pub fn md5_bytes(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Length of an MD5 digest in hex.
pub const MD5_HEX_LEN: usize = 32;

/// Whether `s` is a hex MD5 digest usable as a storage key.
pub fn is_hex_digest(s: &str) -> bool {
    s.len() == MD5_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}
