/// A message part.
///
/// Multi-part messages are sequences of parts where every part except the
/// last carries [`Msg::MORE`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Msg {
    data: Vec<u8>,
    flags: u8,
}

impl Msg {
    /// More parts of the same message follow.
    pub const MORE: u8 = 0x01;
    /// Routing envelope part. Not counted by flow control.
    pub const ROUTING_ID: u8 = 0x02;

    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self::with_flags(data, 0)
    }

    pub fn with_flags(data: impl Into<Vec<u8>>, flags: u8) -> Self {
        Self {
            data: data.into(),
            flags,
        }
    }

    /// A non-final part.
    pub fn more(data: impl Into<Vec<u8>>) -> Self {
        Self::with_flags(data, Self::MORE)
    }

    pub fn routing_id(data: impl Into<Vec<u8>>) -> Self {
        Self::with_flags(data, Self::ROUTING_ID | Self::MORE)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    pub fn has_more(&self) -> bool {
        self.flags & Self::MORE != 0
    }

    pub fn is_routing_id(&self) -> bool {
        self.flags & Self::ROUTING_ID != 0
    }

    /// Whether this part closes a message for flow-control accounting.
    pub(crate) fn completes_message(&self) -> bool {
        !self.has_more() && !self.is_routing_id()
    }
}

/// What travels through a one-way pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Message(Msg),
    /// End-of-stream marker written during termination.
    Delimiter,
    /// Peer credential; absorbed by the reading pipe.
    Credential(Vec<u8>),
}

impl Item {
    pub fn is_delimiter(&self) -> bool {
        matches!(self, Item::Delimiter)
    }

    pub fn is_credential(&self) -> bool {
        matches!(self, Item::Credential(_))
    }
}

impl From<Msg> for Item {
    fn from(msg: Msg) -> Self {
        Item::Message(msg)
    }
}
