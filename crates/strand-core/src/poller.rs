use std::{collections::HashMap, io, sync::Arc, sync::Weak, time::Duration};

use mio::{Events, Poll, Token, unix::SourceFd};
use tracing::{debug, warn};

use crate::{Ready, channel::Channel};

/// Readiness multiplexer over one `mio::Poll`.
///
/// Keeps the token registry; a poll error other than EINTR is fatal,
/// there is no meaningful way to continue the loop without it.
pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    channels: HashMap<Token, Weak<Channel>>,
}

impl Poller {
    pub(crate) fn new() -> Self {
        Self {
            poll: Poll::new().expect("couldn't set up a poll for the event loop"),
            events: Events::with_capacity(1024),
            channels: HashMap::new(),
        }
    }

    /// Harvests ready channels into `active`. Stale tokens (channel
    /// removed with an event already queued) are skipped.
    pub(crate) fn poll(&mut self, timeout: Duration, active: &mut Vec<(Arc<Channel>, Ready)>) {
        if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
            if err.kind() == io::ErrorKind::Interrupted {
                return;
            }
            panic!("event loop poll failed: {err}");
        }

        for event in self.events.iter() {
            let Some(channel) = self.channels.get(&event.token()).and_then(Weak::upgrade) else {
                debug!(token = event.token().0, "event for unknown token");
                continue;
            };
            active.push((channel, Ready::from_event(event)));
        }
    }

    /// Applies the channel's current interest to the OS: register on the
    /// first interest, reregister on changes, deregister when empty.
    pub(crate) fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        match channel.interest() {
            Some(interest) => {
                if channel.is_registered() {
                    if let Err(err) =
                        self.poll.registry().reregister(&mut SourceFd(&fd), channel.token(), interest)
                    {
                        warn!(fd, ?err, "reregister failed");
                    }
                } else {
                    if let Err(err) =
                        self.poll.registry().register(&mut SourceFd(&fd), channel.token(), interest)
                    {
                        warn!(fd, ?err, "register failed");
                        return;
                    }
                    self.channels.insert(channel.token(), Arc::downgrade(channel));
                    channel.set_registered(true);
                }
            }
            None => {
                if channel.is_registered() {
                    if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                        warn!(fd, ?err, "deregister failed");
                    }
                    channel.set_registered(false);
                }
            }
        }
    }

    pub(crate) fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        if channel.is_registered() {
            if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                warn!(fd, ?err, "deregister failed");
            }
            channel.set_registered(false);
        }
        self.channels.remove(&channel.token());
    }
}
