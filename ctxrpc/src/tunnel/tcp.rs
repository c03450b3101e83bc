use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use super::{
    check_scheme, framed::FramedTunnel, TransportationError, Tunnel, TunnelConnector, TunnelInfo,
    TunnelListener,
};

fn socket_addr_from_url(url: &url::Url) -> Result<SocketAddr, TransportationError> {
    check_scheme(url, "tcp")?;
    url.socket_addrs(|| None)
        .map_err(|e| TransportationError::InvalidAddr(format!("{}: {}", url, e)))?
        .into_iter()
        .next()
        .ok_or_else(|| TransportationError::InvalidAddr(url.to_string()))
}

fn build_url_from_socket_addr(addr: &SocketAddr) -> String {
    format!("tcp://{}", addr)
}

fn get_tunnel_with_tcp_stream(stream: TcpStream) -> Result<Box<dyn Tunnel>, TransportationError> {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(?e, "set_nodelay fail");
    }

    let info = TunnelInfo {
        tunnel_type: "tcp".to_owned(),
        local_addr: Some(build_url_from_socket_addr(&stream.local_addr()?)),
        remote_addr: Some(build_url_from_socket_addr(&stream.peer_addr()?)),
    };

    let (r, w) = stream.into_split();
    Ok(FramedTunnel::new(r, w, Some(info)))
}

#[derive(Debug)]
pub struct TcpTunnelListener {
    addr: url::Url,
    listener: Option<TcpListener>,
}

impl TcpTunnelListener {
    pub fn new(addr: url::Url) -> Self {
        TcpTunnelListener {
            addr,
            listener: None,
        }
    }
}

#[async_trait]
impl TunnelListener for TcpTunnelListener {
    async fn listen(&mut self) -> Result<(), TransportationError> {
        if self.listener.is_some() {
            return Ok(());
        }
        let addr = socket_addr_from_url(&self.addr)?;
        let listener = TcpListener::bind(addr).await?;
        // port 0 resolves to a real port here
        self.addr
            .set_port(Some(listener.local_addr()?.port()))
            .map_err(|_| TransportationError::InvalidAddr(self.addr.to_string()))?;
        self.listener = Some(listener);
        Ok(())
    }

    async fn accept(&mut self) -> Result<Box<dyn Tunnel>, TransportationError> {
        let Some(listener) = self.listener.as_ref() else {
            return Err(TransportationError::InternalError(
                "listener not started".to_owned(),
            ));
        };
        let (stream, peer) = listener.accept().await?;
        tracing::info!(?peer, "tcp connection accepted");
        get_tunnel_with_tcp_stream(stream)
    }

    fn local_url(&self) -> url::Url {
        self.addr.clone()
    }
}

#[derive(Debug)]
pub struct TcpTunnelConnector {
    addr: url::Url,
}

impl TcpTunnelConnector {
    pub fn new(addr: url::Url) -> Self {
        TcpTunnelConnector { addr }
    }
}

#[async_trait]
impl TunnelConnector for TcpTunnelConnector {
    async fn connect(&mut self) -> Result<Box<dyn Tunnel>, TransportationError> {
        let addr = socket_addr_from_url(&self.addr)?;
        tracing::info!(url = %self.addr, ?addr, "connect tcp start");
        let stream = TcpStream::connect(addr).await?;
        get_tunnel_with_tcp_stream(stream)
    }

    fn remote_url(&self) -> url::Url {
        self.addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use crate::tunnel::common::tests::_tunnel_pingpong;

    use super::*;

    #[tokio::test]
    async fn tcp_pingpong() {
        let mut listener = TcpTunnelListener::new("tcp://127.0.0.1:0".parse().unwrap());
        listener.listen().await.unwrap();
        let connector = TcpTunnelConnector::new(listener.local_url());
        _tunnel_pingpong(listener, connector).await
    }

    #[test]
    fn reject_wrong_scheme() {
        let url: url::Url = "udp://127.0.0.1:11010".parse().unwrap();
        assert!(matches!(
            socket_addr_from_url(&url),
            Err(TransportationError::InvalidProtocol(_))
        ));
    }
}
