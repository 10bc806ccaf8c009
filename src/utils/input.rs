//! Line input from the terminal.
//!
//! Every prompt in the crate goes through this helper so stdin is always
//! consumed by the same buffered reader. The blocking read runs on the
//! blocking pool, mirroring how the rest of the session stays async.

use std::io::{self, Write};

/// Prints `prompt` and reads one line. `None` means end of input (Ctrl-D or
/// a closed pipe).
pub async fn read_user_line(prompt: &str) -> io::Result<Option<String>> {
    let prompt = prompt.to_string();
    tokio::task::spawn_blocking(move || {
        let mut stdout = io::stdout();
        stdout.write_all(prompt.as_bytes())?;
        stdout.flush()?;
        let mut line = String::new();
        let read = io::stdin().read_line(&mut line)?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    })
    .await
    .map_err(|err| io::Error::other(err))?
}
