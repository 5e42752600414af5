//! 端点地址类型。

use std::fmt;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;

/// 网络地址端点：流式/数据报传输使用 `SocketAddr`；Unix 域传输使用文件路径。
///
/// 直接使用 `std::net::SocketAddr`，不做 `no_std` 适配，更符合 `mio`/
/// `socket2` 的调用面。
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Endpoint {
    Socket(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Endpoint {
    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Socket(addr) => Some(*addr),
            #[cfg(unix)]
            Endpoint::Unix(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Socket(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Socket(addr)
    }
}
