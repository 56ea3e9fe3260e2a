use log::debug;
use sha1::{Digest, Sha1};

use crate::errors::{Error, Result};
use crate::stream::{LineReader, Transport};

/// The protocol GUID every accept key is salted with (RFC 6455 §1.3).
pub const WS_PROTOCOL_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The response sent when the request is not a valid WebSocket upgrade.
pub const DEFAULT_BAD_REQUEST: &str = "HTTP/1.1 400 Bad Request\r\n\r\n";

/// Computes `base64(sha1(client_key || GUID))`.
pub fn accept_key(client_key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(client_key.as_bytes());
    sha.update(WS_PROTOCOL_GUID.as_bytes());
    base64::encode(sha.finalize())
}

fn split_header(line: &str) -> Option<(&str, &str)> {
    let sep = line.find(':')?;
    Some((&line[..sep], line[sep + 1..].trim()))
}

/// Sends the upgrade request and validates the `101` response. Returns the
/// protocol the server accepted (empty if none).
pub fn client_handshake<T: Transport>(
    reader: &mut LineReader<T>,
    host: &str,
    path: &str,
    protocols: &[String],
) -> Result<String> {
    let key_bytes: [u8; 16] = rand::random();
    let key = base64::encode(&key_bytes);

    let mut request = format!(
        "GET {} HTTP/1.1\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Host: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {}\r\n",
        path, host, key
    );
    if !protocols.is_empty() {
        request.push_str("Sec-WebSocket-Protocol: ");
        request.push_str(&protocols.join(", "));
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    reader.get_mut().write_all(request.as_bytes())?;

    let status_line = reader.read_line()?;
    let status = status_line.split_whitespace().nth(1).unwrap_or("");
    if status != "101" {
        return Err(Error::Handshake(format!(
            "unexpected status line: {}",
            status_line
        )));
    }

    let mut found_connection = false;
    let mut found_upgrade = false;
    let mut accept = String::new();
    let mut accepted_protocol = String::new();

    loop {
        let line = reader.read_line()?;
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = split_header(&line) {
            if name.eq_ignore_ascii_case("Connection") {
                found_connection = value.to_ascii_lowercase().contains("upgrade");
            } else if name.eq_ignore_ascii_case("Upgrade") {
                found_upgrade = value.eq_ignore_ascii_case("websocket");
            } else if name.eq_ignore_ascii_case("Sec-WebSocket-Accept") {
                accept = value.to_owned();
            } else if name.eq_ignore_ascii_case("Sec-WebSocket-Protocol") {
                accepted_protocol = value.to_owned();
            }
        }
    }

    if !found_connection || !found_upgrade || accept.is_empty() {
        return Err(Error::Handshake("missing upgrade headers".to_owned()));
    }
    if accept != accept_key(&key) {
        return Err(Error::Handshake("accept key mismatch".to_owned()));
    }

    Ok(accepted_protocol)
}

/// A parsed client upgrade request.
#[derive(Debug, Clone, PartialEq)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
    pub protocols: Vec<String>,
}

/// Reads and validates a client's upgrade request. The caller answers with
/// either `write_upgrade_response` or the bad-request response.
pub fn read_upgrade_request<T: Transport>(reader: &mut LineReader<T>) -> Result<UpgradeRequest> {
    let request_line = reader.read_line()?;
    if !request_line.starts_with("GET ") {
        return Err(Error::Handshake(format!(
            "not a GET request: {}",
            request_line
        )));
    }
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_owned();

    let mut found_connection = false;
    let mut found_upgrade = false;
    let mut key = String::new();
    let mut protocols = Vec::new();

    loop {
        let line = reader.read_line()?;
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = split_header(&line) {
            if name.eq_ignore_ascii_case("Connection") {
                found_connection = value.to_ascii_lowercase().contains("upgrade");
            } else if name.eq_ignore_ascii_case("Upgrade") {
                found_upgrade = value.eq_ignore_ascii_case("websocket");
            } else if name.eq_ignore_ascii_case("Sec-WebSocket-Key") {
                key = value.to_owned();
            } else if name.eq_ignore_ascii_case("Sec-WebSocket-Protocol") {
                protocols.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(str::to_owned),
                );
            }
        }
    }

    if !found_connection || !found_upgrade || key.is_empty() {
        debug!("rejecting upgrade request for {}", path);
        return Err(Error::Handshake("missing upgrade headers".to_owned()));
    }

    Ok(UpgradeRequest {
        path,
        key,
        protocols,
    })
}

/// Writes the `101 Switching Protocols` reply.
pub fn write_upgrade_response<T: Transport>(
    transport: &mut T,
    client_key: &str,
    protocol: Option<&str>,
) -> std::io::Result<()> {
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-Websocket-Accept: {}\r\n",
        accept_key(client_key)
    );
    if let Some(protocol) = protocol {
        response.push_str("Sec-Websocket-Protocol: ");
        response.push_str(protocol);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");

    transport.write_all(response.as_bytes())
}

#[cfg(test)]
mod tests {
    use crate::stream::testing::MockTransport;

    use super::*;

    #[test]
    fn rfc6455_accept_key_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn parses_upgrade_request() {
        let transport = MockTransport::new(vec![b"GET /nt/alice HTTP/1.1\r\n\
              Host: 10.0.0.2:5810\r\n\
              Connection: Upgrade\r\n\
              Upgrade: websocket\r\n\
              Sec-WebSocket-Version: 13\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Protocol: v4.1.networktables.first.wpi.edu, rtt.networktables.first.wpi.edu\r\n\
              \r\n"
            .to_vec()]);
        let mut reader = LineReader::new(transport);
        let request = read_upgrade_request(&mut reader).unwrap();
        assert_eq!(request.path, "/nt/alice");
        assert_eq!(request.key, "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(
            request.protocols,
            vec![
                "v4.1.networktables.first.wpi.edu".to_owned(),
                "rtt.networktables.first.wpi.edu".to_owned()
            ]
        );
    }

    #[test]
    fn rejects_missing_headers() {
        let transport = MockTransport::new(vec![
            b"GET / HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\n\r\n".to_vec(),
        ]);
        let mut reader = LineReader::new(transport);
        assert!(read_upgrade_request(&mut reader).is_err());
    }

    #[test]
    fn rejects_non_get() {
        let transport = MockTransport::new(vec![b"POST / HTTP/1.1\r\n\r\n".to_vec()]);
        let mut reader = LineReader::new(transport);
        assert!(read_upgrade_request(&mut reader).is_err());
    }

    #[test]
    fn upgrade_response_carries_accept_and_protocol() {
        let mut transport = MockTransport::new(vec![]);
        write_upgrade_response(
            &mut transport,
            "dGhlIHNhbXBsZSBub25jZQ==",
            Some("v4.1.networktables.first.wpi.edu"),
        )
        .unwrap();
        let response = String::from_utf8(transport.written()).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-Websocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.contains("Sec-Websocket-Protocol: v4.1.networktables.first.wpi.edu\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn client_handshake_round_trip() {
        // Server reply is only valid if the accept key matches the random
        // client key, so script the exchange by computing it afterwards.
        let transport = MockTransport::new(vec![]);
        let mut reader = LineReader::new(transport.clone());
        // Run the request side alone and parse what was written.
        let written_before = transport.written();
        assert!(written_before.is_empty());
        let err = client_handshake(&mut reader, "10.0.0.2:5810", "/nt/demo", &[]).unwrap_err();
        // No scripted response: the reader hits EOF.
        match err {
            Error::Io(_) => {}
            other => panic!("unexpected error: {:?}", other),
        }
        let request = String::from_utf8(transport.written()).unwrap();
        assert!(request.starts_with("GET /nt/demo HTTP/1.1\r\n"));
        assert!(request.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(request.contains("Sec-WebSocket-Key: "));
    }
}
