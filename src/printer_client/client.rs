use std::collections::BTreeMap;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use log::trace;
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::models::{PrinterEndpoint, StatusSnapshot};

/// Deadline for one complete query exchange, connection setup included.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

// The Guider-family control protocol speaks G-code-style commands over TCP.
// Every response starts with `CMD Mxxx Received.` and ends with `ok`.
const CMD_TAKE_CONTROL: &str = "~M601 S1";
const CMD_MACHINE_STATUS: &str = "~M119";
const CMD_JOB_PROGRESS: &str = "~M27";

const RESPONSE_TERMINATOR: &str = "ok";
const KEY_MACHINE_STATUS: &str = "MachineStatus";
const PROGRESS_PREFIX: &str = "SD printing byte ";

// ////// //
// Errors //
// ////// //

#[derive(Debug, Snafu)]
pub enum QueryError {
    #[snafu(display("could not reach printer {endpoint}: {source}"))]
    Network {
        endpoint: PrinterEndpoint,
        source: io::Error,
    },
    #[snafu(display("printer {endpoint} did not complete a response within {after:?}"))]
    Timeout {
        endpoint: PrinterEndpoint,
        after: Duration,
    },
    #[snafu(display("unparseable response from printer {endpoint}: {reason}"))]
    Protocol {
        endpoint: PrinterEndpoint,
        reason: String,
    },
}

// ////// //
// Client //
// ////// //

/// A single bounded query against one printer.
///
/// Implementations hold no state across calls and perform no retries; retry
/// policy belongs to the poll coordinator.
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    async fn query(
        &self,
        endpoint: &PrinterEndpoint,
        timeout: Duration,
    ) -> Result<StatusSnapshot, QueryError>;
}

/// Stateless client for the FlashForge TCP control protocol.
pub struct FlashforgeClient;

#[async_trait]
impl StatusSource for FlashforgeClient {
    async fn query(
        &self,
        endpoint: &PrinterEndpoint,
        timeout: Duration,
    ) -> Result<StatusSnapshot, QueryError> {
        // Elapsing the deadline drops the whole exchange, closing the socket.
        match tokio::time::timeout(timeout, query_once(endpoint)).await {
            Ok(result) => result,
            Err(_) => TimeoutSnafu { endpoint: endpoint.clone(), after: timeout }.fail(),
        }
    }
}

async fn query_once(endpoint: &PrinterEndpoint) -> Result<StatusSnapshot, QueryError> {
    let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
        .await
        .context(NetworkSnafu { endpoint: endpoint.clone() })?;
    let mut stream = BufReader::new(stream);

    exchange(&mut stream, endpoint, CMD_TAKE_CONTROL).await?;
    let status_lines = exchange(&mut stream, endpoint, CMD_MACHINE_STATUS).await?;
    let progress_lines = exchange(&mut stream, endpoint, CMD_JOB_PROGRESS).await?;

    parse_status(endpoint, &status_lines, &progress_lines)
}

/// Send one `~Mxxx` command and collect the response lines up to the `ok`
/// terminator. Echo headers and blank lines are dropped.
async fn exchange(
    stream: &mut BufReader<TcpStream>,
    endpoint: &PrinterEndpoint,
    command: &str,
) -> Result<Vec<String>, QueryError> {
    stream
        .get_mut()
        .write_all(format!("{command}\r\n").as_bytes())
        .await
        .context(NetworkSnafu { endpoint: endpoint.clone() })?;

    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let read = stream
            .read_line(&mut line)
            .await
            .context(NetworkSnafu { endpoint: endpoint.clone() })?;
        if read == 0 {
            let eof = io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("connection closed during '{command}' response"),
            );
            return Err(QueryError::Network { endpoint: endpoint.clone(), source: eof });
        }
        let line = line.trim();
        trace!("{endpoint} <- {line}");
        if line == RESPONSE_TERMINATOR {
            return Ok(lines);
        }
        if !line.is_empty() && !line.starts_with("CMD ") {
            lines.push(line.to_string());
        }
    }
}

// /////// //
// Parsing //
// /////// //

fn parse_status(
    endpoint: &PrinterEndpoint,
    status_lines: &[String],
    progress_lines: &[String],
) -> Result<StatusSnapshot, QueryError> {
    let mut machine_status = None;
    let mut extra = BTreeMap::new();
    for line in status_lines {
        if let Some((key, value)) = line.split_once(':') {
            let (key, value) = (key.trim(), value.trim());
            if key == KEY_MACHINE_STATUS {
                machine_status = Some(value.to_string());
            }
            // Everything stays available downstream, MachineStatus included:
            // the printing flag cannot express states like PAUSED.
            extra.insert(key.to_string(), value.to_string());
        }
    }

    let machine_status = machine_status.ok_or_else(|| QueryError::Protocol {
        endpoint: endpoint.clone(),
        reason: format!("status response did not include {KEY_MACHINE_STATUS}"),
    })?;
    let printing = machine_status.starts_with("BUILDING_FROM");
    let progress = parse_progress(endpoint, progress_lines)?;

    Ok(StatusSnapshot::online(printing, progress, extra))
}

/// Extract the completion percentage from an `~M27` response.
///
/// The printer reports `SD printing byte <done>/<total>`; an idle printer
/// answers `Not SD printing` or omits the line entirely.
fn parse_progress(
    endpoint: &PrinterEndpoint,
    progress_lines: &[String],
) -> Result<u8, QueryError> {
    for line in progress_lines {
        let Some(counts) = line.strip_prefix(PROGRESS_PREFIX) else {
            continue;
        };
        let parsed = counts.split_once('/').and_then(|(done, total)| {
            let done: u64 = done.trim().parse().ok()?;
            let total: u64 = total.trim().parse().ok()?;
            Some(if total == 0 { 0 } else { (done * 100 / total).min(100) as u8 })
        });
        return parsed.ok_or_else(|| QueryError::Protocol {
            endpoint: endpoint.clone(),
            reason: format!("malformed progress line '{line}'"),
        });
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn endpoint() -> PrinterEndpoint {
        PrinterEndpoint::new("127.0.0.1", 8899)
    }

    #[test]
    fn parses_status_and_preserves_vendor_fields() {
        let status = lines(&[
            "Endstop: X-max:0 Y-max:0 Z-min:0",
            "MachineStatus: BUILDING_FROM_SD",
            "MoveMode: MOVING",
            "CurrentFile: benchy.gx",
        ]);
        let progress = lines(&["SD printing byte 42/100"]);

        let snapshot = parse_status(&endpoint(), &status, &progress).unwrap();
        assert!(snapshot.online);
        assert!(snapshot.printing);
        assert_eq!(snapshot.progress, 42);
        assert_eq!(snapshot.extra["CurrentFile"], "benchy.gx");
        assert_eq!(snapshot.extra["MachineStatus"], "BUILDING_FROM_SD");
    }

    #[test]
    fn idle_printer_is_online_but_not_printing() {
        let status = lines(&["MachineStatus: READY"]);
        let progress = lines(&["Not SD printing"]);

        let snapshot = parse_status(&endpoint(), &status, &progress).unwrap();
        assert!(snapshot.online);
        assert!(!snapshot.printing);
        assert_eq!(snapshot.progress, 0);
    }

    #[test]
    fn missing_machine_status_is_a_protocol_error() {
        let result = parse_status(&endpoint(), &lines(&["MoveMode: READY"]), &[]);
        assert!(matches!(result, Err(QueryError::Protocol { .. })));
    }

    #[test]
    fn malformed_progress_is_a_protocol_error() {
        let result = parse_progress(&endpoint(), &lines(&["SD printing byte forty/100"]));
        assert!(matches!(result, Err(QueryError::Protocol { .. })));
    }

    #[test]
    fn progress_never_exceeds_one_hundred() {
        let progress = parse_progress(&endpoint(), &lines(&["SD printing byte 150/100"])).unwrap();
        assert_eq!(progress, 100);
        let progress = parse_progress(&endpoint(), &lines(&["SD printing byte 0/0"])).unwrap();
        assert_eq!(progress, 0);
    }

    // /////////////////// //
    // Wire-level behavior //
    // /////////////////// //

    fn guider_script(command: &str) -> Option<&'static str> {
        match command {
            "~M601 S1" => Some("CMD M601 Received.\r\nControl Success.\r\nok\r\n"),
            "~M119" => Some(
                "CMD M119 Received.\r\n\
                 Endstop: X-max:0 Y-max:0 Z-min:0\r\n\
                 MachineStatus: BUILDING_FROM_SD\r\n\
                 MoveMode: MOVING\r\n\
                 Status: S:1 L:0 J:0 F:0\r\n\
                 LED: 1\r\n\
                 CurrentFile: benchy.gx\r\n\
                 ok\r\n",
            ),
            "~M27" => Some("CMD M27 Received.\r\nSD printing byte 42/100\r\nok\r\n"),
            _ => None,
        }
    }

    fn no_machine_status_script(command: &str) -> Option<&'static str> {
        match command {
            "~M119" => Some("CMD M119 Received.\r\nMoveMode: READY\r\nok\r\n"),
            _ => guider_script(command),
        }
    }

    /// One-connection mock printer answering commands from a script table.
    async fn spawn_mock_printer(script: fn(&str) -> Option<&'static str>) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            let mut line = String::new();
            loop {
                line.clear();
                if stream.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                match script(line.trim()) {
                    Some(response) => {
                        stream.get_mut().write_all(response.as_bytes()).await.unwrap();
                    }
                    None => break,
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn query_reads_a_full_status() {
        let addr = spawn_mock_printer(guider_script).await;
        let endpoint = PrinterEndpoint::new("127.0.0.1", addr.port());

        let snapshot = FlashforgeClient.query(&endpoint, QUERY_TIMEOUT).await.unwrap();
        assert!(snapshot.online);
        assert!(snapshot.printing);
        assert_eq!(snapshot.progress, 42);
        assert_eq!(snapshot.extra["LED"], "1");
    }

    #[tokio::test]
    async fn query_classifies_connection_refusal_as_network_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let endpoint = PrinterEndpoint::new("127.0.0.1", addr.port());

        let result = FlashforgeClient.query(&endpoint, QUERY_TIMEOUT).await;
        assert!(matches!(result, Err(QueryError::Network { .. })));
    }

    #[tokio::test]
    async fn query_classifies_a_silent_printer_as_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });
        let endpoint = PrinterEndpoint::new("127.0.0.1", addr.port());

        let result = FlashforgeClient.query(&endpoint, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(QueryError::Timeout { .. })));
    }

    #[tokio::test]
    async fn query_classifies_bad_response_as_protocol_error() {
        let addr = spawn_mock_printer(no_machine_status_script).await;
        let endpoint = PrinterEndpoint::new("127.0.0.1", addr.port());

        let result = FlashforgeClient.query(&endpoint, QUERY_TIMEOUT).await;
        assert!(matches!(result, Err(QueryError::Protocol { .. })));
    }
}
