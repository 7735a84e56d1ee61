use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// 以位元組逐行讀取，不要求內容是 UTF-8。
///
/// 子行程或控制端送來的無效位元組不會讓讀取中斷。
pub struct RawLines<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> RawLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// 回傳去掉 `\n` / `\r\n` 的一行；EOF 時為 `None`
    pub async fn next_raw(&mut self) -> std::io::Result<Option<&[u8]>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        Ok(Some(self.buf.as_slice()))
    }

    /// 無法解碼的位元組以 U+FFFD 取代
    pub async fn next_lossy(&mut self) -> std::io::Result<Option<String>> {
        Ok(self
            .next_raw()
            .await?
            .map(|raw| String::from_utf8_lossy(raw).into_owned()))
    }
}
