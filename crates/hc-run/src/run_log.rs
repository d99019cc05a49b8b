//! Import of the engine's run log.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// File the engine writes its run log to, inside the export directory.
pub const RUN_LOG_FILE_NAME: &str = "dimr_redirected.log";

const CHUNK_SIZE: usize = 256 * 1024;

/// Read the run log in bounded chunks. A missing file yields `None`.
pub fn read_run_log(path: &Path) -> io::Result<Option<String>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut bytes = Vec::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        bytes.extend_from_slice(&chunk[..read]);
    }
    // Engines may write in a legacy code page.
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}
