// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{Sink, Stream};
use pin_project::pin_project;
use tokio_util::codec::Framed;

use crate::codec::MessageCodec;
use crate::msg::Message;
use crate::platform::Channel;

/// A transport that serializes [`Message`]s to, and deserializes them from,
/// a byte stream. One `start_send` emits one whole frame; writes never
/// interleave fragments of different frames.
#[pin_project]
pub struct Transport {
    #[pin]
    inner: Framed<Channel, MessageCodec>,
}

impl Transport {
    /// Returns the channel over which messages are sent and received.
    pub fn get_ref(&self) -> &Channel {
        self.inner.get_ref()
    }
}

impl From<Channel> for Transport {
    fn from(channel: Channel) -> Self {
        Transport {
            inner: Framed::new(channel, MessageCodec::default()),
        }
    }
}

impl Stream for Transport {
    type Item = io::Result<Message>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Message>>> {
        self.project().inner.poll_next(cx)
    }
}

impl Sink<Message> for Transport {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> io::Result<()> {
        self.project().inner.start_send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_close(cx)
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::msg::StreamPull;
    use futures::{SinkExt, StreamExt};
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn sends_and_receives_over_a_socket_pair() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut left = Transport::from(Channel::from(a));
        let mut right = Transport::from(Channel::from(b));

        left.send(Message::StreamPull(StreamPull {
            stream_id: 9,
            amount: 1024,
        }))
        .await
        .unwrap();

        let received = right.next().await.unwrap().unwrap();
        assert_eq!(
            received,
            Message::StreamPull(StreamPull {
                stream_id: 9,
                amount: 1024,
            })
        );
    }
}
