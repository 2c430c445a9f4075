use std::io::SeekFrom;

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

/// Positions `file` at the beginning of its last line and returns that offset. A trailing newline
/// terminates the last line instead of starting an empty one. `buffer` bounds how much is read
/// per step while scanning backwards.
pub async fn seek_last_line(
    file: &mut (impl AsyncSeek + AsyncRead + Unpin),
    buffer: &mut [u8],
) -> Result<u64, io::Error> {
    assert!(!buffer.is_empty());
    let end = file.seek(SeekFrom::End(0)).await?;
    let mut search_end = end.saturating_sub(1);

    while search_end > 0 {
        let chunk = u64::min(search_end, buffer.len() as u64) as usize;
        let chunk_start = search_end - chunk as u64;
        file.seek(SeekFrom::Start(chunk_start)).await?;
        file.read_exact(&mut buffer[..chunk]).await?;

        if let Some(offset) = buffer[..chunk].iter().rposition(|v| *v == b'\n') {
            let line_start = chunk_start + offset as u64 + 1;
            file.seek(SeekFrom::Start(line_start)).await?;
            return Ok(line_start);
        }
        search_end = chunk_start;
    }

    file.seek(SeekFrom::Start(0)).await?;
    Ok(0)
}

/// Reads the last line of `file` without its terminating newline. Empty files produce [None].
pub async fn read_last_line(
    file: &mut (impl AsyncSeek + AsyncRead + Unpin),
) -> Result<Option<String>, io::Error> {
    seek_last_line(file, &mut [0; 1024]).await?;
    let mut line = String::new();
    file.read_to_string(&mut line).await?;
    let line = line.trim_end_matches(['\n', '\r']);
    if line.is_empty() {
        Ok(None)
    } else {
        Ok(Some(line.to_string()))
    }
}
