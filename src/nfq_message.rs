use nfq::Message;

use crate::ecn::{self, EcnMark, INET_ECN_CE};

/// Queued netfilter packet; the payload is rewritten only when its ECN field changes.
pub struct NfqMessage(Message);

impl AsRef<[u8]> for NfqMessage {
    fn as_ref(&self) -> &[u8] {
        self.0.get_payload()
    }
}

impl EcnMark for NfqMessage {
    fn set_ce(&mut self) -> bool {
        match ecn::codepoint(self.0.get_payload()) {
            Some(INET_ECN_CE) => true,
            Some(_) => {
                let mut payload = self.0.get_payload().to_vec();
                let marked = ecn::set_ce(&mut payload);
                if marked {
                    self.0.set_payload(payload);
                }
                marked
            }
            None => false,
        }
    }
}

impl From<Message> for NfqMessage {
    fn from(value: Message) -> Self {
        Self(value)
    }
}

impl From<NfqMessage> for Message {
    fn from(value: NfqMessage) -> Self {
        value.0
    }
}
