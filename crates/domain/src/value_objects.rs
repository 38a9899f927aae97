use std::fmt;

use gateway_errors::GatewayError;
use url::Url;

/// 任务优先级
///
/// 优先级编码在源文件定位符的端口部分，例如 `nfs://storage:8080/movie.mkv`
/// 的优先级为 8080。无法解析或没有端口时为 0。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(u32);

impl Priority {
    pub const UNSET: Priority = Priority(0);

    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// 从定位符的端口中提取优先级
    pub fn from_locator(locator: &str) -> Self {
        Url::parse(locator)
            .ok()
            .and_then(|url| url.port())
            .map(|port| Priority(u32::from(port)))
            .unwrap_or(Priority::UNSET)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl From<u32> for Priority {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 被捕获输出所属的标准流，按文件描述符编号区分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdStream {
    StdIn = 0,
    StdOut = 1,
    StdErr = 2,
}

impl StdStream {
    pub fn fd(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for StdStream {
    type Error = GatewayError;

    fn try_from(fd: u8) -> Result<Self, Self::Error> {
        match fd {
            0 => Ok(StdStream::StdIn),
            1 => Ok(StdStream::StdOut),
            2 => Ok(StdStream::StdErr),
            other => Err(GatewayError::decode(format!(
                "unsupported file descriptor {other}, expected 0 (stdin), 1 (stdout) or 2 (stderr)"
            ))),
        }
    }
}

/// 一行被捕获的标准流输出
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdStreamLine {
    pub stream: StdStream,
    pub line: String,
}

impl StdStreamLine {
    pub fn new(stream: StdStream, line: impl Into<String>) -> Self {
        Self {
            stream,
            line: line.into(),
        }
    }

    pub fn stdout(line: impl Into<String>) -> Self {
        Self::new(StdStream::StdOut, line)
    }

    pub fn stderr(line: impl Into<String>) -> Self {
        Self::new(StdStream::StdErr, line)
    }
}
