//! 错误类型
//!
//! 分类对应接收链路上的几类可恢复故障: 传输 / 分帧 / 序号 / 解码 / 配置读写。
//! 所有这些错误都不会让工作线程退出, 只会变成丢帧计数或一条日志。

use std::io;

/// Result 别名
pub type Result<T> = std::result::Result<T, Error>;

/// camfeed 错误类型
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 超时 / 连接被重置 / 拒绝连接
    #[error("传输错误: {0}")]
    Transport(#[from] io::Error),

    /// 帧头损坏或数据报过短
    #[error("分帧错误: {0}")]
    Framing(String),

    /// 帧序号不连续
    #[error("帧序号不连续: 期望 {expected}, 实际 {got}")]
    Sequencing { expected: u32, got: u32 },

    /// 某个分包的序号与位置不符
    #[error("帧 {frame_id} 的分包 {packet} 序号错误")]
    Corrupted { frame_id: u32, packet: u32 },

    /// 图像解码失败
    #[error("解码失败: {0}")]
    Decode(String),

    /// 持久化配置读写失败
    #[error("配置读写失败: {0}")]
    ConfigIo(String),

    /// 控制连接未建立
    #[error("控制连接未建立")]
    NotConnected,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// 是否属于接收链路的已知故障 (计为丢帧后继续)
    ///
    /// `Other` 不在已知分类内, 调用方应以更高的日志级别记录。
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Other(_))
    }

    /// 是否为接收超时
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Transport(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// 连接已断开 (对端重置 / 管道破裂 / 已中止)
    pub fn is_broken_link(&self) -> bool {
        match self {
            Error::Transport(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            Error::NotConnected => true,
            _ => false,
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<fast_image_resize::ResizeError> for Error {
    fn from(e: fast_image_resize::ResizeError) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<fast_image_resize::ImageBufferError> for Error {
    fn from(e: fast_image_resize::ImageBufferError) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ConfigIo(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        let e: Error = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(e.is_timeout());
        assert!(!e.is_broken_link());

        let e: Error = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(!e.is_timeout());
        assert!(e.is_broken_link());
    }

    #[test]
    fn test_other_is_not_recoverable() {
        assert!(!Error::Other("bug".into()).is_recoverable());
        assert!(Error::Decode("bad jpeg".into()).is_recoverable());
        assert!(Error::Sequencing { expected: 3, got: 4 }.is_recoverable());
    }
}
