use std::io::Error;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server};

/// Connection to an origin server.
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS
  Tls(Box<client::TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
  /// Protocol chosen by ALPN, if any.
  pub fn alpn_protocol(&self) -> Option<&[u8]> {
    match self {
      MaybeTlsStream::Tcp(_) => None,
      MaybeTlsStream::Tls(stream) => stream.get_ref().1.alpn_protocol(),
    }
  }
}

/// Connection accepted from a client, after any TLS interception.
#[derive(Debug)]
pub enum ClientStream {
  /// Plaintext HTTP
  Plain(TcpStream),
  /// TLS terminated with a forged leaf
  Tls(Box<server::TlsStream<TcpStream>>),
}

impl ClientStream {
  /// Protocol chosen by ALPN, if any.
  pub fn alpn_protocol(&self) -> Option<&[u8]> {
    match self {
      ClientStream::Plain(_) => None,
      ClientStream::Tls(stream) => stream.get_ref().1.alpn_protocol(),
    }
  }
}

// Both enums forward straight to the wrapped stream.
macro_rules! forward_io {
  ($ty:ident, $a:ident, $b:ident) => {
    impl AsyncRead for $ty {
      fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
      ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
          $ty::$a(stream) => Pin::new(stream).poll_read(cx, buf),
          $ty::$b(stream) => Pin::new(stream).poll_read(cx, buf),
        }
      }
    }

    impl AsyncWrite for $ty {
      fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
      ) -> Poll<Result<usize, Error>> {
        match self.get_mut() {
          $ty::$a(stream) => Pin::new(stream).poll_write(cx, buf),
          $ty::$b(stream) => Pin::new(stream).poll_write(cx, buf),
        }
      }

      fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        match self.get_mut() {
          $ty::$a(stream) => Pin::new(stream).poll_flush(cx),
          $ty::$b(stream) => Pin::new(stream).poll_flush(cx),
        }
      }

      fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        match self.get_mut() {
          $ty::$a(stream) => Pin::new(stream).poll_shutdown(cx),
          $ty::$b(stream) => Pin::new(stream).poll_shutdown(cx),
        }
      }
    }
  };
}

forward_io!(MaybeTlsStream, Tcp, Tls);
forward_io!(ClientStream, Plain, Tls);
