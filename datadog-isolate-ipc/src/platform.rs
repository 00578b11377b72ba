// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stream-socket channel underneath the framed transport. The daemon is
//! reachable either over a filesystem socket or a TCP host/port pair.

use std::io;
#[cfg(unix)]
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

/// Where the daemon listens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(String, u16),
}

#[derive(Debug)]
#[pin_project(project = ChannelProj)]
pub enum Channel {
    #[cfg(unix)]
    Unix(#[pin] UnixStream),
    Tcp(#[pin] TcpStream),
}

#[cfg(unix)]
impl From<UnixStream> for Channel {
    fn from(stream: UnixStream) -> Self {
        Channel::Unix(stream)
    }
}

impl From<TcpStream> for Channel {
    fn from(stream: TcpStream) -> Self {
        Channel::Tcp(stream)
    }
}

impl Channel {
    /// Opens a channel to `endpoint`, failing with `TimedOut` if the
    /// connection is not established within `timeout`.
    pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> io::Result<Channel> {
        let connect = async {
            match endpoint {
                #[cfg(unix)]
                Endpoint::Unix(path) => UnixStream::connect(path).await.map(Channel::from),
                Endpoint::Tcp(host, port) => TcpStream::connect((host.as_str(), *port))
                    .await
                    .map(Channel::from),
            }
        };
        tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
    }
}

impl AsyncRead for Channel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            #[cfg(unix)]
            ChannelProj::Unix(stream) => stream.poll_read(cx, buf),
            ChannelProj::Tcp(stream) => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Channel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            #[cfg(unix)]
            ChannelProj::Unix(stream) => stream.poll_write(cx, buf),
            ChannelProj::Tcp(stream) => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            #[cfg(unix)]
            ChannelProj::Unix(stream) => stream.poll_flush(cx),
            ChannelProj::Tcp(stream) => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            #[cfg(unix)]
            ChannelProj::Unix(stream) => stream.poll_shutdown(cx),
            ChannelProj::Tcp(stream) => stream.poll_shutdown(cx),
        }
    }
}
