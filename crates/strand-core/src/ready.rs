use mio::event::Event;

/// Condensed readiness snapshot handed from the poller to a channel.
///
/// Collapses the platform readiness flags into the four states the
/// dispatch path distinguishes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ready {
    bits: u8,
}

const READABLE: u8 = 1 << 0;
const WRITABLE: u8 = 1 << 1;
const ERROR: u8 = 1 << 2;
const HUP: u8 = 1 << 3;

impl Ready {
    pub(crate) fn from_event(event: &Event) -> Self {
        let mut bits = 0;
        if event.is_readable() || event.is_priority() {
            bits |= READABLE;
        }
        if event.is_writable() {
            bits |= WRITABLE;
        }
        if event.is_error() {
            bits |= ERROR;
        }
        if event.is_read_closed() && event.is_write_closed() {
            bits |= HUP;
        }
        Self { bits }
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.bits & READABLE != 0
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.bits & WRITABLE != 0
    }

    #[inline]
    pub fn is_error(self) -> bool {
        self.bits & ERROR != 0
    }

    #[inline]
    pub fn is_hup(self) -> bool {
        self.bits & HUP != 0
    }
}
