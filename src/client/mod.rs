//! Client-side API stub and command-line parsing for the test client.

use std::net::SocketAddr;

use crate::protocol::{self, ApiReply, ApiRequest, NodeReply, NodeRequest};
use crate::utils::KvError;

use tokio::time::Duration;

/// Client API stub for talking to the coordinator.
pub struct KvClient {
    /// Address of the coordinator's API socket.
    coord_addr: SocketAddr,

    /// Time limit on each request-reply exchange.
    call_timeout: Duration,
}

impl KvClient {
    pub fn new(coord_addr: SocketAddr, call_timeout: Duration) -> Self {
        KvClient {
            coord_addr,
            call_timeout,
        }
    }

    /// Sends one API request and waits for its reply.
    pub async fn request(&self, req: &ApiRequest) -> Result<ApiReply, KvError> {
        protocol::call(self.coord_addr, req, self.call_timeout).await
    }

    /// Sends a fault-injection command directly to a replica.
    pub async fn fault_inject(
        &self,
        addr: SocketAddr,
        req: &NodeRequest,
    ) -> Result<NodeReply, KvError> {
        protocol::call(addr, req, self.call_timeout).await
    }
}

/// Parses one colon-delimited command line into an API request. On a parse
/// failure, returns the error reply that should be displayed, mirroring what
/// the coordinator replies for malformed input.
pub fn parse_command(line: &str) -> Result<ApiRequest, ApiReply> {
    let line = line.trim();
    if line.eq_ignore_ascii_case("STATS") {
        return Ok(ApiRequest::Stats);
    }
    match line.split_once(':') {
        Some(("PUT", rest)) => match rest.split_once(':') {
            // the value keeps any further colons verbatim
            Some((key, value)) if !key.is_empty() => Ok(ApiRequest::Put {
                key: key.into(),
                value: value.into(),
            }),
            _ => Err(ApiReply::Err {
                reason: "InvalidPUTFormat".into(),
            }),
        },
        Some(("GET", key)) if !key.is_empty() => Ok(ApiRequest::Get {
            key: key.into(),
        }),
        Some(("GET", _)) => Err(ApiReply::Err {
            reason: "InvalidGETFormat".into(),
        }),
        _ => Err(ApiReply::Err {
            reason: "UnknownCommand".into(),
        }),
    }
}

#[cfg(test)]
mod client_tests {
    use super::*;

    #[test]
    fn parse_valid_commands() {
        assert_eq!(
            parse_command("PUT:session:user001"),
            Ok(ApiRequest::Put {
                key: "session".into(),
                value: "user001".into(),
            })
        );
        // value keeps embedded colons
        assert_eq!(
            parse_command("PUT:k:a:b:c"),
            Ok(ApiRequest::Put {
                key: "k".into(),
                value: "a:b:c".into(),
            })
        );
        assert_eq!(
            parse_command("GET:k"),
            Ok(ApiRequest::Get { key: "k".into() })
        );
        assert_eq!(parse_command("STATS"), Ok(ApiRequest::Stats));
        assert_eq!(parse_command("  stats  "), Ok(ApiRequest::Stats));
    }

    #[test]
    fn parse_invalid_commands() {
        assert_eq!(
            parse_command("PUT:keyonly"),
            Err(ApiReply::Err {
                reason: "InvalidPUTFormat".into()
            })
        );
        assert_eq!(
            parse_command("GET:"),
            Err(ApiReply::Err {
                reason: "InvalidGETFormat".into()
            })
        );
        assert_eq!(
            parse_command("DELETE:k"),
            Err(ApiReply::Err {
                reason: "UnknownCommand".into()
            })
        );
        assert_eq!(
            parse_command(""),
            Err(ApiReply::Err {
                reason: "UnknownCommand".into()
            })
        );
    }
}
