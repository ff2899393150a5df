//! Serde views of the `hcloud` CLI's JSON output.
//!
//! Every field the crate relies on is optional at the parse layer; the client
//! promotes absent fields to [`super::HcloudError::ResponseInvalid`] instead
//! of failing deserialisation with an opaque message.

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct CreateServerResponse {
    pub(crate) server: Option<ServerInfo>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct ServerInfo {
    pub(crate) id: Option<u64>,
    pub(crate) public_net: Option<PublicNet>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct PublicNet {
    pub(crate) ipv4: Option<Ipv4Info>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct Ipv4Info {
    pub(crate) ip: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct SshKeyInfo {
    pub(crate) name: String,
}
