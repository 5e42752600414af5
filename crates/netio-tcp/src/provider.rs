//! TCP Channel Provider：流式传输的 `ChannelProvider` 实现。
//!
//! `mio::net::TcpStream` 提供非阻塞原始句柄；`socket2::SockRef` 用来配置
//! `SO_LINGER`/`SO_REUSEADDR`。`write_backlog_started/ended` 通过
//! `SelectorHandler::reregister_interest` 在 `READABLE` 与
//! `READABLE | WRITABLE` 之间切换，并在每次调用后唤醒 selector。

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpStream as MioTcpStream;
use mio::{Interest, Registry, Token};
use netio_core::error::{Op, map_io_error};
use netio_core::selector::SelectorHandler;
use netio_core::{ChannelProvider, NetError};
use socket2::SockRef;

/// 套接字级配置：`SO_LINGER` 与 `TCP_NODELAY`。
#[derive(Clone, Debug, Default)]
pub struct TcpSocketConfig {
    linger: Option<Duration>,
    nodelay: bool,
}

impl TcpSocketConfig {
    pub const fn new() -> Self {
        Self {
            linger: None,
            nodelay: true,
        }
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    fn apply(&self, stream: &MioTcpStream) -> io::Result<()> {
        let sock = SockRef::from(stream);
        sock.set_linger(self.linger)?;
        stream.set_nodelay(self.nodelay)
    }
}

/// 该 provider 当前对 selector 的兴趣：是否读阻塞、是否处于写回退。
#[derive(Clone, Copy, Debug)]
struct InterestState {
    read_blocked: bool,
    write_backlog: bool,
}

impl InterestState {
    fn to_mio(self) -> Interest {
        match (self.read_blocked, self.write_backlog) {
            (true, true) => Interest::WRITABLE,
            (true, false) => Interest::WRITABLE, // degenerate; selector.rs never calls with both false+blocked+no-backlog
            (false, true) => Interest::READABLE | Interest::WRITABLE,
            (false, false) => Interest::READABLE,
        }
    }
}

pub struct TcpChannelProvider {
    stream: Option<MioTcpStream>,
    config: TcpSocketConfig,
    selector: Option<Arc<SelectorHandler>>,
    token: Option<Token>,
    interest: InterestState,
}

impl TcpChannelProvider {
    /// 客户端侧构造：尚未连接，`connect()` 调用时才真正打开套接字。
    pub fn unconnected(config: TcpSocketConfig) -> Self {
        Self {
            stream: None,
            config,
            selector: None,
            token: None,
            interest: InterestState {
                read_blocked: false,
                write_backlog: false,
            },
        }
    }

    /// 服务端侧构造：套接字已由 `accept()` 产生并完成连接。
    pub fn from_accepted(stream: MioTcpStream, config: TcpSocketConfig) -> io::Result<Self> {
        config.apply(&stream)?;
        Ok(Self {
            stream: Some(stream),
            config,
            selector: None,
            token: None,
            interest: InterestState {
                read_blocked: false,
                write_backlog: false,
            },
        })
    }

    /// 绑定到已经向某个 selector 注册过的 token；`write_backlog_started/ended`
    /// 与 `set_read_block` 据此知道该对谁重新声明兴趣。
    pub fn bind_registration(&mut self, selector: Arc<SelectorHandler>, token: Token) {
        self.selector = Some(selector);
        self.token = Some(token);
    }

    pub fn local_socket_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn peer_socket_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    /// `SO_ERROR`, consumed once: the standard way to discover whether a
    /// non-blocking `connect()` that reported writable-readiness actually
    /// succeeded. `Ok(None)` means the connect completed cleanly.
    pub fn take_socket_error(&self) -> io::Result<Option<io::Error>> {
        match self.stream.as_ref() {
            Some(stream) => SockRef::from(stream).take_error(),
            None => Ok(None),
        }
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    fn reapply_interest(&mut self) -> Result<(), NetError> {
        let (Some(selector), Some(token)) = (self.selector.clone(), self.token) else {
            return Ok(());
        };
        selector
            .reregister_interest(token, self.interest.to_mio())
            .map_err(|e| map_io_error(Op::Register, e))?;
        let _ = selector.wakeup();
        Ok(())
    }
}

impl ChannelProvider for TcpChannelProvider {
    fn connect(&mut self, remote: SocketAddr, _timeout: Duration) -> Result<bool, NetError> {
        let stream = MioTcpStream::connect(remote).map_err(|e| map_io_error(Op::Connect, e))?;
        self.config
            .apply(&stream)
            .map_err(|e| map_io_error(Op::Configure, e))?;
        // A loopback connect can complete synchronously; a successful
        // `peer_addr()` right after `connect()` is the cheapest signal mio
        // exposes for that without waiting on a writable event.
        let immediate = stream.peer_addr().is_ok();
        self.stream = Some(stream);
        Ok(immediate)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, NetError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(NetError::UnsupportedOperation("read before the socket is established"))?;
        match stream.read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(map_io_error(Op::Read, e)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, NetError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(NetError::UnsupportedOperation("write before the socket is established"))?;
        match stream.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(map_io_error(Op::Write, e)),
        }
    }

    fn write_backlog_started(&mut self) -> Result<(), NetError> {
        self.interest.write_backlog = true;
        self.reapply_interest()
    }

    fn write_backlog_ended(&mut self) -> Result<(), NetError> {
        self.interest.write_backlog = false;
        self.reapply_interest()
    }

    fn set_read_block(&mut self, block: bool) -> Result<(), NetError> {
        self.interest.read_blocked = block;
        self.reapply_interest()
    }

    fn is_available(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) -> Result<(), NetError> {
        if let (Some(selector), Some(token)) = (self.selector.take(), self.token.take()) {
            selector.deregister(token);
        }
        // Dropping `self.stream` closes the fd; mio sockets have no
        // explicit `close()`, matching `std::net::TcpStream`'s Drop.
        self.stream = None;
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_socket_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_socket_addr()
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "tcp stream not yet established"))?;
        match registry.register(stream, token, interest) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                registry.reregister(stream, token, interest)
            }
            Err(e) => Err(e),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => registry.deregister(stream),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_state_read_blocked_and_no_backlog_still_watches_writable() {
        // Degenerate case documented on `InterestState::to_mio`: a connection
        // that is read-blocked but has nothing queued keeps WRITABLE armed
        // rather than going interest-less (mio rejects empty `Interest`).
        let state = InterestState {
            read_blocked: true,
            write_backlog: false,
        };
        assert_eq!(state.to_mio(), Interest::WRITABLE);
    }

    #[test]
    fn interest_state_default_watches_only_readable() {
        let state = InterestState {
            read_blocked: false,
            write_backlog: false,
        };
        assert_eq!(state.to_mio(), Interest::READABLE);
    }
}
