use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha1::{Digest, Sha1};

/// Read buffer size. Files are streamed through the hasher so a multi-GB
/// video sitting next to the photos never gets pulled into memory whole.
const CHUNK_SIZE: usize = 64 * 1024;

/// Compute the lowercase hex SHA-1 digest of a file's content. The asset
/// server keys its duplicate check on this digest, so it must depend on
/// bytes only, never on path or timestamps.
pub fn sha1_hex(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
