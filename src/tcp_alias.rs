use std::fmt::{Display, Formatter};

use serde::Serialize;

// A TCP alias identity: the address and port that independent SSH sessions
// register against in order to share one public endpoint.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct TcpAlias(pub String, pub u16);

impl Display for TcpAlias {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}
