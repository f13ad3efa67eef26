use tokio::io::{AsyncRead, AsyncReadExt};

/// Reads a stream to EOF, keeping at most `limit` bytes.
///
/// The rest is drained so the child never blocks on a full pipe, and is
/// replaced by a marker saying how much was dropped.
pub async fn capture<R>(mut reader: R, limit: usize) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut dropped: u64 = 0;
    let mut buf = [0u8; 8192];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        let take = room.min(n);
        kept.extend_from_slice(&buf[..take]);
        dropped += (n - take) as u64;
    }

    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if dropped > 0 {
        text.push_str(&truncation_marker(dropped));
    }
    Ok(text)
}

pub fn truncation_marker(dropped: u64) -> String {
    format!("\n[... {dropped} bytes truncated]")
}
