//! Print dispatch: raw ESC/POS over TCP with a plain-text file fallback.
//!
//! The printer is addressed as `host:port` (usually port 9100). When no
//! printer is configured, or it cannot be reached, the receipt is written to
//! `<data_dir>/tickets/` instead and the caller gets the file path back.

use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{self, DeviceConfig};
use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};
use crate::escpos::PaperWidth;
use crate::receipt::{self, Receipt};
use crate::report;
use crate::sales::{self, STATUS_VOIDED};
use crate::till;

/// Timeout for TCP connection to the printer.
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for writing the job once connected.
const TCP_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PrintSettings {
    /// `host:port` of a raw ESC/POS printer.
    pub printer: Option<String>,
    pub paper: PaperWidth,
    pub tickets_dir: PathBuf,
}

impl PrintSettings {
    pub fn from_config(cfg: &DeviceConfig, data_dir: &Path) -> Self {
        Self {
            printer: cfg.printer.clone().filter(|p| !p.trim().is_empty()),
            paper: PaperWidth::from_mm(cfg.paper_width_mm),
            tickets_dir: config::tickets_dir(data_dir),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PrintOutcome {
    Printed {
        printer: String,
    },
    SavedToFile {
        path: PathBuf,
        /// Why the printer was not used, when one is configured.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl PrintOutcome {
    pub fn is_printed(&self) -> bool {
        matches!(self, PrintOutcome::Printed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketPrint {
    pub ticket_id: i64,
    pub outcome: PrintOutcome,
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

fn resolve(addr_str: &str) -> PosResult<SocketAddr> {
    addr_str
        .to_socket_addrs()
        .map_err(|e| PosError::Printer(format!("Invalid printer address {addr_str}: {e}")))?
        .next()
        .ok_or_else(|| PosError::Printer(format!("Printer address {addr_str} did not resolve")))
}

/// Send a raw job to a network printer.
pub fn send_tcp(addr_str: &str, data: &[u8]) -> PosResult<()> {
    let addr = resolve(addr_str)?;

    let stream = TcpStream::connect_timeout(&addr, TCP_CONNECT_TIMEOUT)
        .map_err(|e| PosError::Printer(format!("TCP connect to {addr_str} failed: {e}")))?;
    stream.set_write_timeout(Some(TCP_WRITE_TIMEOUT))?;

    let mut writer = std::io::BufWriter::new(stream);
    writer
        .write_all(data)
        .and_then(|_| writer.flush())
        .map_err(|e| PosError::Printer(format!("TCP write to {addr_str} failed: {e}")))?;

    info!(addr = %addr_str, bytes = data.len(), "ESC/POS job sent");
    Ok(())
}

fn save_text(dir: &Path, stem: &str, text: &str) -> PosResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let mut path = dir.join(format!("{stem}_{stamp}.txt"));
    let mut n = 2;
    while path.exists() {
        path = dir.join(format!("{stem}_{stamp}_{n}.txt"));
        n += 1;
    }
    std::fs::write(&path, text)?;
    Ok(path)
}

/// Print `receipt`, falling back to a text file named after `stem`.
pub fn deliver(settings: &PrintSettings, receipt: &Receipt, stem: &str) -> PosResult<PrintOutcome> {
    let reason = match settings.printer.as_deref() {
        Some(printer) => match send_tcp(printer, &receipt.to_escpos(settings.paper)) {
            Ok(()) => {
                return Ok(PrintOutcome::Printed {
                    printer: printer.to_string(),
                })
            }
            Err(e) => {
                warn!(printer, "Printer unavailable, saving to file: {e}");
                Some(e.to_string())
            }
        },
        None => None,
    };
    let path = save_text(&settings.tickets_dir, stem, &receipt.to_text(settings.paper))?;
    info!(path = %path.display(), "Receipt saved to file");
    Ok(PrintOutcome::SavedToFile { path, reason })
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Print one ticket per id. Tickets that reach the printer move to
/// `Impreso`; voided tickets are refused.
pub fn print_tickets(
    db: &DbState,
    settings: &PrintSettings,
    ticket_ids: &[i64],
) -> PosResult<Vec<TicketPrint>> {
    let jobs = {
        let conn = db.conn.lock()?;
        let mut jobs = Vec::with_capacity(ticket_ids.len());
        for &id in ticket_ids {
            let ticket = sales::get_ticket_conn(&conn, id)?;
            if ticket.status == STATUS_VOIDED {
                return Err(PosError::invalid_state(format!(
                    "ticket {id} is voided and cannot be printed"
                )));
            }
            let code = match ticket.caja_id {
                Some(caja_id) => till::get_till_conn(&conn, caja_id)?.label(),
                None => "-".to_string(),
            };
            jobs.push((id, receipt::sale_ticket(&ticket, &code)));
        }
        jobs
    };

    let mut results = Vec::with_capacity(jobs.len());
    for (id, r) in jobs {
        let outcome = deliver(settings, &r, &format!("ticket_{id}"))?;
        results.push(TicketPrint {
            ticket_id: id,
            outcome,
        });
    }

    let printed: Vec<i64> = results
        .iter()
        .filter(|r| r.outcome.is_printed())
        .map(|r| r.ticket_id)
        .collect();
    if !printed.is_empty() {
        sales::mark_printed(db, &printed)?;
    }
    if printed.len() < results.len() {
        if let Ok(conn) = db.conn.lock() {
            db::record_error(
                &conn,
                "print",
                &format!("{} ticket(s) saved to file", results.len() - printed.len()),
            );
        }
    }
    Ok(results)
}

/// Print the close report of a till.
pub fn print_close_report(
    db: &DbState,
    settings: &PrintSettings,
    till_id: i64,
) -> PosResult<PrintOutcome> {
    let summary = report::till_summary(db, till_id)?;
    let r = receipt::close_report(&summary);
    deliver(settings, &r, &format!("cierre_caja_{till_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::insert_product;
    use crate::catalog::PaymentMethodRef;
    use crate::db::test_db;
    use crate::sales::{checkout, get_ticket, CartLine, CheckoutRequest, STATUS_PRINTED};
    use crate::till::open_till;
    use crate::till::tests::{open_req, POS};
    use std::net::TcpListener;

    /// Spin up a TCP listener on an ephemeral port and return (listener, port).
    fn tcp_test_server() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral TCP port for test");
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    /// Accept `jobs` connections and return everything received on each.
    fn spawn_sink(listener: TcpListener, jobs: usize) -> std::thread::JoinHandle<Vec<Vec<u8>>> {
        std::thread::spawn(move || {
            use std::io::Read;
            (0..jobs)
                .map(|_| {
                    let (mut stream, _addr) = listener.accept().expect("accept TCP connection");
                    let mut buf = Vec::new();
                    stream.read_to_end(&mut buf).expect("read from TCP connection");
                    buf
                })
                .collect()
        })
    }

    fn settings(printer: Option<String>, dir: &Path) -> PrintSettings {
        PrintSettings {
            printer,
            paper: PaperWidth::Mm58,
            tickets_dir: dir.to_path_buf(),
        }
    }

    fn sell(db: &DbState, quantity: i64) -> Vec<i64> {
        let product = insert_product(db, "GAS", "Gaseosa", 1200.0, 999, true);
        open_till(db, POS, &open_req(0.0)).unwrap();
        checkout(
            db,
            POS,
            &CheckoutRequest {
                lines: vec![CartLine {
                    product_id: product,
                    quantity,
                    unit_price: None,
                }],
                payment: PaymentMethodRef::from("Efectivo"),
            },
        )
        .unwrap()
        .tickets
        .iter()
        .map(|t| t.id)
        .collect()
    }

    #[test]
    fn test_send_tcp_receives_exact_bytes() {
        let (listener, port) = tcp_test_server();
        let handle = spawn_sink(listener, 1);

        send_tcp(&format!("127.0.0.1:{port}"), b"\x1b@hola").unwrap();

        let received = handle.join().expect("TCP server thread panicked");
        assert_eq!(received, vec![b"\x1b@hola".to_vec()]);
    }

    #[test]
    fn test_send_tcp_failure_returns_error() {
        let (listener, port) = tcp_test_server();
        drop(listener);

        let err = send_tcp(&format!("127.0.0.1:{port}"), b"x").unwrap_err();
        assert!(
            err.to_string().contains("TCP connect"),
            "Expected TCP error, got: {err}"
        );
        assert!(send_tcp("no-port-here", b"x").is_err());
    }

    #[test]
    fn test_tickets_printed_over_tcp_are_marked() {
        let db = test_db();
        let ids = sell(&db, 2);
        let (listener, port) = tcp_test_server();
        let handle = spawn_sink(listener, 2);
        let dir = tempfile::tempdir().unwrap();

        let results =
            print_tickets(&db, &settings(Some(format!("127.0.0.1:{port}")), dir.path()), &ids)
                .unwrap();

        assert!(results.iter().all(|r| r.outcome.is_printed()));
        let received = handle.join().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(&received[0][..2], &[0x1B, 0x40]);
        for id in ids {
            assert_eq!(get_ticket(&db, id).unwrap().status, STATUS_PRINTED);
        }
    }

    #[test]
    fn test_unreachable_printer_falls_back_to_file() {
        let db = test_db();
        let ids = sell(&db, 1);
        let (listener, port) = tcp_test_server();
        drop(listener);
        let dir = tempfile::tempdir().unwrap();

        let results =
            print_tickets(&db, &settings(Some(format!("127.0.0.1:{port}")), dir.path()), &ids)
                .unwrap();

        match &results[0].outcome {
            PrintOutcome::SavedToFile { path, reason } => {
                let text = std::fs::read_to_string(path).unwrap();
                assert!(text.contains("GASEOSA"));
                assert!(reason.as_deref().unwrap_or("").contains("TCP connect"));
            }
            other => panic!("expected file fallback, got {other:?}"),
        }
        // not physically printed
        assert_ne!(get_ticket(&db, ids[0]).unwrap().status, STATUS_PRINTED);
    }

    #[test]
    fn test_no_printer_saves_close_report() {
        let db = test_db();
        sell(&db, 1);
        let till = crate::till::current_till(&db, POS).unwrap().unwrap();
        let dir = tempfile::tempdir().unwrap();

        let outcome = print_close_report(&db, &settings(None, dir.path()), till.id).unwrap();
        let PrintOutcome::SavedToFile { path, reason } = outcome else {
            panic!("expected file fallback");
        };
        assert!(reason.is_none());
        assert!(std::fs::read_to_string(path)
            .unwrap()
            .contains("CIERRE DE CAJA"));
    }

    #[test]
    fn test_voided_ticket_is_not_printed() {
        let db = test_db();
        let ids = sell(&db, 1);
        sales::void_ticket(&db, ids[0]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            print_tickets(&db, &settings(None, dir.path()), &ids),
            Err(PosError::InvalidState(_))
        ));
    }
}
