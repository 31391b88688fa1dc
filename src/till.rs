//! Till ("caja") lifecycle and cash reconciliation.
//!
//! A till is opened with a float, accumulates sales and manual cash
//! movements, and is closed once with the counted cash. States go
//! `abierta` → `cerrada`; there is no re-open.
//!
//! Reconciliation (formula v2, used by every new till):
//!
//! ```text
//! teorico    = fondo_inicial + total_ventas + ingresos - retiros
//! real       = conteo_efectivo + transferencias
//! diferencia = real - teorico        (positive = surplus)
//! ```
//!
//! Tills closed by the legacy v1 formula keep their stored figures; see
//! [`FormulaVersion`].

use std::path::Path;

use chrono::{Local, NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backup::{self, BackupStatus};
use crate::catalog;
use crate::cloud_sync;
use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};
use crate::terminal;

const MAX_CASHIER_LEN: usize = 10;
const MAX_OPENING_NOTES_LEN: usize = 30;
const MAX_EVENT_LEN: usize = 100;
const DEFAULT_DISCIPLINE: &str = "BAR";
/// Rows returned by [`list_tills`] when no date filter is given.
pub const DEFAULT_LIST_LIMIT: i64 = 200;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TillState {
    Abierta,
    Cerrada,
}

impl TillState {
    pub fn as_str(self) -> &'static str {
        match self {
            TillState::Abierta => "abierta",
            TillState::Cerrada => "cerrada",
        }
    }

    fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("abierta") {
            TillState::Abierta
        } else {
            TillState::Cerrada
        }
    }
}

/// Which reconciliation formula produced a till's stored figures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FormulaVersion {
    /// Legacy: transfers and the float on both sides, only cash sales in
    /// the theoretical amount.
    V1,
    /// Current: every non-voided sale in the theoretical amount.
    V2,
}

impl FormulaVersion {
    pub const CURRENT: FormulaVersion = FormulaVersion::V2;

    pub fn from_db(raw: Option<i64>) -> Self {
        match raw {
            Some(v) if v >= 2 => FormulaVersion::V2,
            _ => FormulaVersion::V1,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            FormulaVersion::V1 => 1,
            FormulaVersion::V2 => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Till {
    pub id: i64,
    pub codigo_caja: Option<String>,
    pub disciplina: Option<String>,
    pub fecha: String,
    pub usuario_apertura: Option<String>,
    pub cajero_apertura: Option<String>,
    pub hora_apertura: String,
    pub apertura_dt: Option<String>,
    pub fondo_inicial: f64,
    pub observaciones_apertura: Option<String>,
    pub descripcion_evento: Option<String>,
    pub estado: TillState,
    pub hora_cierre: Option<String>,
    pub usuario_cierre: Option<String>,
    pub cierre_dt: Option<String>,
    pub total_ventas: Option<f64>,
    pub total_efectivo_teorico: Option<f64>,
    pub conteo_efectivo_final: Option<f64>,
    pub transferencias_final: Option<f64>,
    pub ingresos: f64,
    pub retiros: f64,
    pub diferencia: Option<f64>,
    pub total_tickets: Option<i64>,
    pub tickets_anulados: Option<i64>,
    pub obs_cierre: Option<String>,
    pub pos_uuid: Option<String>,
    pub caja_uuid: Option<String>,
    pub pos_caja_id: Option<i64>,
    pub caja_prefijo: Option<String>,
    pub ticket_seq: i64,
    pub calculation_version: FormulaVersion,
    pub nube_enviado: bool,
    pub nube_uuid: Option<String>,
    pub enviado_nube_ts: Option<String>,
}

impl Till {
    pub fn is_open(&self) -> bool {
        self.estado == TillState::Abierta
    }

    /// Human-readable label used in logs and errors.
    pub fn label(&self) -> String {
        self.codigo_caja
            .clone()
            .unwrap_or_else(|| format!("#{}", self.id))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenTillRequest {
    /// Logged-in user opening the till.
    pub usuario: String,
    /// Name of the person operating the till.
    pub cajero: String,
    pub fondo_inicial: f64,
    #[serde(default)]
    pub disciplina: Option<String>,
    #[serde(default)]
    pub template_id: Option<i64>,
    #[serde(default)]
    pub descripcion_evento: Option<String>,
    #[serde(default)]
    pub observaciones: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloseTillRequest {
    pub conteo_efectivo: f64,
    /// Defaults to the live total of non-cash sales.
    #[serde(default)]
    pub transferencias: Option<f64>,
    pub usuario_cierre: String,
    #[serde(default)]
    pub observaciones: Option<String>,
}

/// Figures re-derived from sales and the movement ledger.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct LiveTotals {
    pub total_ventas: f64,
    pub ventas_efectivo: f64,
    pub ventas_transferencia: f64,
    pub ingresos: f64,
    pub retiros: f64,
    pub tickets_emitidos: i64,
    pub tickets_anulados: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileInputs {
    pub fondo_inicial: f64,
    pub total_ventas: f64,
    pub ventas_efectivo: f64,
    pub ingresos: f64,
    pub retiros: f64,
    pub conteo_efectivo: f64,
    pub transferencias: f64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct Reconciliation {
    pub version: FormulaVersion,
    pub teorico: f64,
    pub real: f64,
    pub diferencia: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClosePreview {
    pub till_id: i64,
    pub totals: LiveTotals,
    pub transferencias: f64,
    pub reconciliation: Reconciliation,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseOutcome {
    pub till: Till,
    pub totals: LiveTotals,
    pub reconciliation: Reconciliation,
    pub backup: BackupStatus,
}

// ---------------------------------------------------------------------------
// Reconciliation math
// ---------------------------------------------------------------------------

pub fn round_money(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Compute the theoretical cash, the real amount and the difference.
pub fn reconcile(inputs: &ReconcileInputs, version: FormulaVersion) -> Reconciliation {
    let ReconcileInputs {
        fondo_inicial,
        total_ventas,
        ventas_efectivo,
        ingresos,
        retiros,
        conteo_efectivo,
        transferencias,
    } = *inputs;

    let (teorico, real) = match version {
        FormulaVersion::V2 => (
            fondo_inicial + total_ventas + ingresos - retiros,
            conteo_efectivo + transferencias,
        ),
        FormulaVersion::V1 => (
            fondo_inicial + ventas_efectivo + ingresos - retiros + transferencias,
            conteo_efectivo + transferencias + ingresos - retiros + fondo_inicial,
        ),
    };

    let teorico = round_money(teorico);
    let real = round_money(real);
    Reconciliation {
        version,
        teorico,
        real,
        diferencia: round_money(real - teorico),
    }
}

// ---------------------------------------------------------------------------
// Code generation
// ---------------------------------------------------------------------------

/// Base code for a till: `{prefijo}-{YYYYMMDD}-{disciplina}`.
pub fn base_code(prefijo: &str, fecha: NaiveDate, disciplina: &str) -> String {
    format!("{prefijo}-{}-{disciplina}", fecha.format("%Y%m%d"))
}

/// Next free code for `base` given the codes already used. `base` itself
/// counts as sequence 1 and `base-N` as N.
pub fn next_till_code(base: &str, existing: &[String]) -> String {
    let suffix_prefix = format!("{base}-");
    let max_used = existing
        .iter()
        .filter_map(|code| {
            if code == base {
                Some(1)
            } else {
                code.strip_prefix(&suffix_prefix)
                    .and_then(|n| n.parse::<u32>().ok())
            }
        })
        .max();
    match max_used {
        None => base.to_string(),
        Some(n) => format!("{base}-{}", n + 1),
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const TILL_COLUMNS: &str = "id, codigo_caja, disciplina, fecha, usuario_apertura, cajero_apertura,
    hora_apertura, apertura_dt, fondo_inicial, observaciones_apertura, descripcion_evento, estado,
    hora_cierre, usuario_cierre, cierre_dt, total_ventas, total_efectivo_teorico,
    conteo_efectivo_final, transferencias_final, COALESCE(ingresos, 0), COALESCE(retiros, 0),
    diferencia, total_tickets, tickets_anulados, obs_cierre, pos_uuid, caja_uuid, pos_caja_id,
    caja_prefijo, COALESCE(ticket_seq, 0), calculation_version, COALESCE(nube_enviado, 0),
    nube_uuid, enviado_nube_ts";

fn till_from_row(row: &rusqlite::Row) -> rusqlite::Result<Till> {
    Ok(Till {
        id: row.get(0)?,
        codigo_caja: row.get(1)?,
        disciplina: row.get(2)?,
        fecha: row.get(3)?,
        usuario_apertura: row.get(4)?,
        cajero_apertura: row.get(5)?,
        hora_apertura: row.get(6)?,
        apertura_dt: row.get(7)?,
        fondo_inicial: row.get(8)?,
        observaciones_apertura: row.get(9)?,
        descripcion_evento: row.get(10)?,
        estado: TillState::parse(&row.get::<_, String>(11)?),
        hora_cierre: row.get(12)?,
        usuario_cierre: row.get(13)?,
        cierre_dt: row.get(14)?,
        total_ventas: row.get(15)?,
        total_efectivo_teorico: row.get(16)?,
        conteo_efectivo_final: row.get(17)?,
        transferencias_final: row.get(18)?,
        ingresos: row.get(19)?,
        retiros: row.get(20)?,
        diferencia: row.get(21)?,
        total_tickets: row.get(22)?,
        tickets_anulados: row.get(23)?,
        obs_cierre: row.get(24)?,
        pos_uuid: row.get(25)?,
        caja_uuid: row.get(26)?,
        pos_caja_id: row.get(27)?,
        caja_prefijo: row.get(28)?,
        ticket_seq: row.get(29)?,
        calculation_version: FormulaVersion::from_db(row.get(30)?),
        nube_enviado: row.get::<_, i64>(31)? != 0,
        nube_uuid: row.get(32)?,
        enviado_nube_ts: row.get(33)?,
    })
}

pub(crate) fn get_till_conn(conn: &Connection, id: i64) -> PosResult<Till> {
    conn.query_row(
        &format!("SELECT {TILL_COLUMNS} FROM caja_diaria WHERE id = ?1"),
        params![id],
        till_from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found(format!("till {id}")))
}

pub(crate) fn current_till_conn(conn: &Connection, pos_uuid: &str) -> PosResult<Option<Till>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {TILL_COLUMNS} FROM caja_diaria
                 WHERE estado = 'abierta' AND pos_uuid = ?1
                 ORDER BY id DESC LIMIT 1"
            ),
            params![pos_uuid],
            till_from_row,
        )
        .optional()?)
}

// ---------------------------------------------------------------------------
// Open
// ---------------------------------------------------------------------------

fn optional_text(raw: &Option<String>, field: &str, max: usize) -> PosResult<Option<String>> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) if text.chars().count() > max => Err(PosError::validation(format!(
            "{field} must be at most {max} characters"
        ))),
        Some(text) => Ok(Some(text.to_string())),
    }
}

/// Open a till on this POS.
///
/// Fails with [`PosError::Conflict`] when the POS already has an open till.
pub fn open_till(db: &DbState, pos_uuid: &str, req: &OpenTillRequest) -> PosResult<Till> {
    let conn = db.conn.lock()?;
    open_till_at(&conn, pos_uuid, req, Local::now().naive_local())
}

pub(crate) fn open_till_at(
    conn: &Connection,
    pos_uuid: &str,
    req: &OpenTillRequest,
    now: NaiveDateTime,
) -> PosResult<Till> {
    let usuario = req.usuario.trim();
    if usuario.is_empty() {
        return Err(PosError::validation("opening user is required"));
    }
    let cajero = req.cajero.trim();
    if cajero.is_empty() {
        return Err(PosError::validation("cashier name is required"));
    }
    if cajero.chars().count() > MAX_CASHIER_LEN {
        return Err(PosError::validation(format!(
            "cashier name must be at most {MAX_CASHIER_LEN} characters"
        )));
    }
    if !req.fondo_inicial.is_finite() || req.fondo_inicial < 0.0 {
        return Err(PosError::validation("opening float must be a non-negative number"));
    }
    let observaciones = optional_text(&req.observaciones, "notes", MAX_OPENING_NOTES_LEN)?;
    let evento = optional_text(&req.descripcion_evento, "event description", MAX_EVENT_LEN)?;
    let disciplina = req
        .disciplina
        .as_deref()
        .map(|d| d.trim().to_uppercase())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| DEFAULT_DISCIPLINE.to_string());

    let till_id = db::with_write_tx(conn, |conn| {
        if let Some(open) = current_till_conn(conn, pos_uuid)? {
            return Err(PosError::Conflict(format!(
                "till {} is already open on this POS",
                open.label()
            )));
        }
        if !catalog::discipline_exists(conn, &disciplina)? {
            return Err(PosError::validation(format!("unknown discipline {disciplina}")));
        }
        let template = terminal::resolve_template(conn, req.template_id)?;

        let fecha = now.date().format("%Y-%m-%d").to_string();
        let base = base_code(&template.prefijo, now.date(), &disciplina);
        let existing: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT codigo_caja FROM caja_diaria
                 WHERE fecha = ?1 AND disciplina = ?2 AND codigo_caja IS NOT NULL",
            )?;
            let codes = stmt
                .query_map(params![fecha, disciplina], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            codes
        };
        let codigo = next_till_code(&base, &existing);

        let inserted = conn.execute(
            "INSERT INTO caja_diaria (
                codigo_caja, disciplina, fecha, usuario_apertura, cajero_apertura,
                hora_apertura, apertura_dt, fondo_inicial, observaciones_apertura,
                descripcion_evento, estado, ingresos, retiros, transferencias_final,
                pos_uuid, caja_uuid, pos_caja_id, caja_prefijo, ticket_seq,
                calculation_version, nube_enviado
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'abierta', 0, 0, 0,
                      ?11, ?12, ?13, ?14, 0, ?15, 0)",
            params![
                codigo,
                disciplina,
                fecha,
                usuario,
                cajero,
                now.format("%H:%M:%S").to_string(),
                now.format("%Y-%m-%d %H:%M:%S").to_string(),
                req.fondo_inicial,
                observaciones,
                evento,
                pos_uuid,
                Uuid::new_v4().to_string(),
                template.id,
                template.prefijo,
                FormulaVersion::CURRENT.as_i64(),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(PosError::Conflict(
                    "another till was opened on this POS at the same time".into(),
                ));
            }
            Err(e) => return Err(e.into()),
        }
        Ok(conn.last_insert_rowid())
    })?;

    let till = get_till_conn(conn, till_id)?;
    info!(
        till_id = till.id,
        code = %till.label(),
        fondo = till.fondo_inicial,
        pos_uuid = %pos_uuid,
        "Till opened"
    );
    Ok(till)
}

// ---------------------------------------------------------------------------
// Live totals and close
// ---------------------------------------------------------------------------

/// Re-derive sales and ledger totals for a till.
pub(crate) fn live_totals(conn: &Connection, till_id: i64) -> PosResult<LiveTotals> {
    let (total_ventas, ventas_efectivo, emitidos, anulados): (f64, f64, i64, i64) = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN COALESCE(t.status, '') != 'Anulado' THEN t.total_ticket END), 0),
            COALESCE(SUM(CASE WHEN COALESCE(t.status, '') != 'Anulado'
                               AND LOWER(COALESCE(mp.descripcion, '')) LIKE 'efectivo%'
                              THEN t.total_ticket END), 0),
            COUNT(CASE WHEN COALESCE(t.status, '') != 'Anulado' THEN 1 END),
            COUNT(CASE WHEN t.status = 'Anulado' THEN 1 END)
         FROM tickets t
         JOIN ventas v ON v.id = t.venta_id
         LEFT JOIN metodos_pago mp ON mp.id = v.metodo_pago_id
         WHERE v.caja_id = ?1",
        params![till_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
    )?;

    let (ingresos, retiros): (f64, f64) = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN tipo = 'INGRESO' THEN monto END), 0),
            COALESCE(SUM(CASE WHEN tipo = 'RETIRO' THEN monto END), 0)
         FROM caja_movimiento WHERE caja_id = ?1",
        params![till_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;

    Ok(LiveTotals {
        total_ventas: round_money(total_ventas),
        ventas_efectivo: round_money(ventas_efectivo),
        ventas_transferencia: round_money(total_ventas - ventas_efectivo),
        ingresos: round_money(ingresos),
        retiros: round_money(retiros),
        tickets_emitidos: emitidos,
        tickets_anulados: anulados,
    })
}

fn validate_close_amounts(conteo: f64, transferencias: Option<f64>) -> PosResult<()> {
    if !conteo.is_finite() || conteo < 0.0 {
        return Err(PosError::validation("counted cash must be a non-negative number"));
    }
    if let Some(t) = transferencias {
        if !t.is_finite() || t < 0.0 {
            return Err(PosError::validation("transfers must be a non-negative number"));
        }
    }
    Ok(())
}

fn preview_conn(
    conn: &Connection,
    till: &Till,
    conteo: f64,
    transferencias: Option<f64>,
) -> PosResult<ClosePreview> {
    let totals = live_totals(conn, till.id)?;
    let transferencias = transferencias.unwrap_or(totals.ventas_transferencia);
    let reconciliation = reconcile(
        &ReconcileInputs {
            fondo_inicial: till.fondo_inicial,
            total_ventas: totals.total_ventas,
            ventas_efectivo: totals.ventas_efectivo,
            ingresos: totals.ingresos,
            retiros: totals.retiros,
            conteo_efectivo: conteo,
            transferencias,
        },
        FormulaVersion::CURRENT,
    );
    Ok(ClosePreview {
        till_id: till.id,
        totals,
        transferencias,
        reconciliation,
    })
}

/// Live difference for an open till while the cash is being counted.
pub fn preview_close(
    db: &DbState,
    till_id: i64,
    conteo_efectivo: f64,
    transferencias: Option<f64>,
) -> PosResult<ClosePreview> {
    validate_close_amounts(conteo_efectivo, transferencias)?;
    let conn = db.conn.lock()?;
    let till = get_till_conn(&conn, till_id)?;
    if !till.is_open() {
        return Err(PosError::invalid_state(format!(
            "till {} is already closed",
            till.label()
        )));
    }
    preview_conn(&conn, &till, conteo_efectivo, transferencias)
}

/// Close a till: persist the reconciliation, queue it for cloud sync and
/// then copy the database into `backup_dir` (best effort).
pub fn close_till(
    db: &DbState,
    till_id: i64,
    req: &CloseTillRequest,
    backup_dir: Option<&Path>,
) -> PosResult<CloseOutcome> {
    let (till, totals, reconciliation) = {
        let conn = db.conn.lock()?;
        close_till_at(&conn, till_id, req, Local::now().naive_local())?
    };

    let backup = match backup_dir {
        Some(dir) => match backup::backup_database(db, dir) {
            Ok(path) => BackupStatus::Saved { path },
            Err(e) => {
                warn!(till_id, "Backup after close failed: {e}");
                if let Ok(conn) = db.conn.lock() {
                    db::record_error(&conn, "backup", &e.to_string());
                }
                BackupStatus::Failed {
                    error: e.to_string(),
                }
            }
        },
        None => BackupStatus::Skipped,
    };

    Ok(CloseOutcome {
        till,
        totals,
        reconciliation,
        backup,
    })
}

pub(crate) fn close_till_at(
    conn: &Connection,
    till_id: i64,
    req: &CloseTillRequest,
    now: NaiveDateTime,
) -> PosResult<(Till, LiveTotals, Reconciliation)> {
    validate_close_amounts(req.conteo_efectivo, req.transferencias)?;
    let usuario_cierre = req.usuario_cierre.trim();
    if usuario_cierre.is_empty() {
        return Err(PosError::validation("closing user is required"));
    }
    let obs = req
        .observaciones
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let (totals, reconciliation, transferencias) = db::with_write_tx(conn, |conn| {
        let till = get_till_conn(conn, till_id)?;
        if !till.is_open() {
            return Err(PosError::invalid_state(format!(
                "till {} is already closed",
                till.label()
            )));
        }

        let preview = preview_conn(conn, &till, req.conteo_efectivo, req.transferencias)?;
        let ClosePreview {
            totals,
            transferencias,
            reconciliation,
            ..
        } = preview;

        conn.execute(
            "UPDATE caja_diaria SET
                estado = 'cerrada',
                hora_cierre = ?2,
                cierre_dt = ?3,
                usuario_cierre = ?4,
                total_ventas = ?5,
                total_efectivo_teorico = ?6,
                conteo_efectivo_final = ?7,
                transferencias_final = ?8,
                total_transferencias = ?9,
                ingresos = ?10,
                retiros = ?11,
                diferencia = ?12,
                total_tickets = ?13,
                tickets_anulados = ?14,
                obs_cierre = ?15,
                calculation_version = ?16
             WHERE id = ?1 AND estado = 'abierta'",
            params![
                till_id,
                now.format("%H:%M:%S").to_string(),
                now.format("%Y-%m-%d %H:%M:%S").to_string(),
                usuario_cierre,
                totals.total_ventas,
                reconciliation.teorico,
                req.conteo_efectivo,
                transferencias,
                totals.ventas_transferencia,
                totals.ingresos,
                totals.retiros,
                reconciliation.diferencia,
                totals.tickets_emitidos,
                totals.tickets_anulados,
                obs,
                reconciliation.version.as_i64(),
            ],
        )?;

        let closed = get_till_conn(conn, till_id)?;
        cloud_sync::enqueue_till(conn, &closed)?;
        Ok((totals, reconciliation, transferencias))
    })?;

    let till = get_till_conn(conn, till_id)?;
    info!(
        till_id,
        code = %till.label(),
        total_ventas = totals.total_ventas,
        teorico = reconciliation.teorico,
        conteo = req.conteo_efectivo,
        transferencias,
        diferencia = reconciliation.diferencia,
        "Till closed"
    );
    Ok((till, totals, reconciliation))
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub fn get_till(db: &DbState, id: i64) -> PosResult<Till> {
    let conn = db.conn.lock()?;
    get_till_conn(&conn, id)
}

/// The open till of this POS, if any.
pub fn current_till(db: &DbState, pos_uuid: &str) -> PosResult<Option<Till>> {
    let conn = db.conn.lock()?;
    current_till_conn(&conn, pos_uuid)
}

/// Tills of a given date (`YYYY-MM-DD`), or the latest
/// [`DEFAULT_LIST_LIMIT`] when no date is given. Newest first.
pub fn list_tills(db: &DbState, fecha: Option<&str>) -> PosResult<Vec<Till>> {
    let conn = db.conn.lock()?;
    list_tills_conn(&conn, fecha)
}

pub(crate) fn list_tills_conn(conn: &Connection, fecha: Option<&str>) -> PosResult<Vec<Till>> {
    match fecha.map(str::trim).filter(|f| !f.is_empty()) {
        Some(fecha) => {
            NaiveDate::parse_from_str(fecha, "%Y-%m-%d")
                .map_err(|_| PosError::validation(format!("invalid date {fecha}, expected YYYY-MM-DD")))?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {TILL_COLUMNS} FROM caja_diaria WHERE fecha = ?1 ORDER BY id DESC"
            ))?;
            let rows = stmt
                .query_map(params![fecha], till_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TILL_COLUMNS} FROM caja_diaria ORDER BY fecha DESC, id DESC LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![DEFAULT_LIST_LIMIT], till_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::movements::{self, MovementKind};

    pub(crate) const POS: &str = "pos-test";

    pub(crate) fn open_req(fondo: f64) -> OpenTillRequest {
        OpenTillRequest {
            usuario: "admin".into(),
            cajero: "Laura".into(),
            fondo_inicial: fondo,
            disciplina: None,
            template_id: None,
            descripcion_evento: Some("Fecha 3 torneo".into()),
            observaciones: None,
        }
    }

    pub(crate) fn close_req(conteo: f64, transferencias: Option<f64>) -> CloseTillRequest {
        CloseTillRequest {
            conteo_efectivo: conteo,
            transferencias,
            usuario_cierre: "admin".into(),
            observaciones: None,
        }
    }

    fn at(date: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{date} 18:30:00"), "%Y-%m-%d %H:%M:%S").unwrap()
    }

    /// Insert a sale of one ticket straight into the tables.
    pub(crate) fn insert_ticket(db: &DbState, till_id: i64, amount: f64, method: i64, status: &str) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO ventas (fecha_hora, total_venta, metodo_pago_id, caja_id)
             VALUES ('2025-03-01 19:00:00', ?1, ?2, ?3)",
            params![amount, method, till_id],
        )
        .unwrap();
        let venta = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO tickets (venta_id, fecha_hora, status, total_ticket)
             VALUES (?1, '2025-03-01 19:00:00', ?2, ?3)",
            params![venta, status, amount],
        )
        .unwrap();
    }

    #[test]
    fn test_open_till_from_before_upgrade_closes_under_current_formula() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE caja_diaria (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                codigo_caja TEXT,
                disciplina TEXT,
                fecha TEXT NOT NULL,
                usuario_apertura TEXT,
                hora_apertura TEXT NOT NULL,
                fondo_inicial REAL NOT NULL,
                observaciones_apertura TEXT,
                estado TEXT NOT NULL,
                diferencia REAL
            );
            INSERT INTO caja_diaria (codigo_caja, disciplina, fecha, hora_apertura, fondo_inicial, estado, diferencia)
                VALUES ('Caj01-20241101-BAR', 'BAR', '2024-11-01', '18:00:00', 800, 'cerrada', 35);
            INSERT INTO caja_diaria (codigo_caja, disciplina, fecha, hora_apertura, fondo_inicial, estado)
                VALUES ('Caj01-20241102-BAR', 'BAR', '2024-11-02', '18:00:00', 1000, 'abierta');",
        )
        .unwrap();
        db::run_migrations_for_test(&conn);
        let db = DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        };

        // closed rows keep the legacy formula, the open one does not
        assert_eq!(get_till(&db, 1).unwrap().calculation_version, FormulaVersion::V1);
        assert_eq!(get_till(&db, 2).unwrap().calculation_version, FormulaVersion::V2);

        movements::record_movement(&db, 2, MovementKind::Ingreso, 200.0, None).unwrap();
        let out = close_till(&db, 2, &close_req(1200.0, Some(0.0)), None).unwrap();
        assert_eq!(out.reconciliation.version, FormulaVersion::V2);
        assert_eq!(out.reconciliation.teorico, 1200.0);
        assert_eq!(out.reconciliation.diferencia, 0.0);
        assert_eq!(out.till.calculation_version, FormulaVersion::V2);
        assert_eq!(out.till.diferencia, Some(0.0));
        assert_eq!(get_till(&db, 1).unwrap().diferencia, Some(35.0));
    }

    #[test]
    fn test_close_stamps_current_formula_over_stale_version() {
        let db = test_db();
        let till = open_till(&db, POS, &open_req(1000.0)).unwrap();
        db.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE caja_diaria SET calculation_version = 1 WHERE id = ?1",
                params![till.id],
            )
            .unwrap();

        let preview = preview_close(&db, till.id, 1000.0, Some(0.0)).unwrap();
        assert_eq!(preview.reconciliation.version, FormulaVersion::V2);
        assert_eq!(preview.reconciliation.diferencia, 0.0);
        let out = close_till(&db, till.id, &close_req(1000.0, Some(0.0)), None).unwrap();
        assert_eq!(out.till.calculation_version, FormulaVersion::V2);
    }

    #[test]
    fn test_next_till_code_sequence() {
        let base = "Caj01-20250301-BAR";
        assert_eq!(next_till_code(base, &[]), base);
        assert_eq!(
            next_till_code(base, &[base.to_string()]),
            "Caj01-20250301-BAR-2"
        );
        let existing = vec![
            base.to_string(),
            format!("{base}-2"),
            format!("{base}-7"),
            "Caj02-20250301-BAR".to_string(),
            format!("{base}-x"),
        ];
        assert_eq!(next_till_code(base, &existing), "Caj01-20250301-BAR-8");
        // only a suffixed code left behind still moves the sequence forward
        assert_eq!(
            next_till_code(base, &[format!("{base}-3")]),
            "Caj01-20250301-BAR-4"
        );
    }

    #[test]
    fn test_reconcile_v2() {
        let r = reconcile(
            &ReconcileInputs {
                fondo_inicial: 1000.0,
                total_ventas: 5000.0,
                ventas_efectivo: 3000.0,
                ingresos: 200.0,
                retiros: 500.0,
                conteo_efectivo: 3650.0,
                transferencias: 2000.0,
            },
            FormulaVersion::V2,
        );
        assert_eq!(r.teorico, 5700.0);
        assert_eq!(r.real, 5650.0);
        assert_eq!(r.diferencia, -50.0);
    }

    #[test]
    fn test_reconcile_v1_keeps_legacy_meaning() {
        let r = reconcile(
            &ReconcileInputs {
                fondo_inicial: 1000.0,
                total_ventas: 5000.0,
                ventas_efectivo: 3000.0,
                ingresos: 200.0,
                retiros: 500.0,
                conteo_efectivo: 3700.0,
                transferencias: 2000.0,
            },
            FormulaVersion::V1,
        );
        assert_eq!(r.teorico, 5700.0);
        assert_eq!(r.real, 6400.0);
        assert_eq!(r.diferencia, 700.0);
    }

    #[test]
    fn test_reconcile_rounds_to_cents() {
        let r = reconcile(
            &ReconcileInputs {
                fondo_inicial: 0.1,
                total_ventas: 0.2,
                ventas_efectivo: 0.2,
                ingresos: 0.0,
                retiros: 0.0,
                conteo_efectivo: 0.3,
                transferencias: 0.0,
            },
            FormulaVersion::V2,
        );
        assert_eq!(r.diferencia, 0.0);
    }

    #[test]
    fn test_open_generates_codes_per_day_and_discipline() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        let first = open_till_at(&conn, POS, &open_req(1000.0), at("2025-03-01")).unwrap();
        assert_eq!(first.codigo_caja.as_deref(), Some("Caj01-20250301-BAR"));
        assert_eq!(first.estado, TillState::Abierta);
        assert_eq!(first.calculation_version, FormulaVersion::V2);
        assert_eq!(first.cajero_apertura.as_deref(), Some("Laura"));
        assert!(first.caja_uuid.is_some());

        close_till_at(&conn, first.id, &close_req(1000.0, None), at("2025-03-01")).unwrap();
        let second = open_till_at(&conn, POS, &open_req(500.0), at("2025-03-01")).unwrap();
        assert_eq!(second.codigo_caja.as_deref(), Some("Caj01-20250301-BAR-2"));

        close_till_at(&conn, second.id, &close_req(500.0, None), at("2025-03-01")).unwrap();
        let mut req = open_req(0.0);
        req.disciplina = Some("futi".into());
        req.template_id = Some(2);
        let third = open_till_at(&conn, POS, &req, at("2025-03-01")).unwrap();
        assert_eq!(third.codigo_caja.as_deref(), Some("Caj02-20250301-FUTI"));
    }

    #[test]
    fn test_only_one_open_till_per_pos() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        open_till_at(&conn, POS, &open_req(100.0), at("2025-03-01")).unwrap();
        let err = open_till_at(&conn, POS, &open_req(100.0), at("2025-03-01")).unwrap_err();
        assert!(matches!(err, PosError::Conflict(_)));
        // another device sharing the database is independent
        open_till_at(&conn, "pos-other", &open_req(100.0), at("2025-03-01")).unwrap();
        let open: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM caja_diaria WHERE estado = 'abierta' AND pos_uuid = ?1",
                params![POS],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(open, 1);
    }

    #[test]
    fn test_open_validation() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        let now = at("2025-03-01");

        let mut req = open_req(100.0);
        req.cajero = "NombreMuyLargo".into();
        assert!(matches!(
            open_till_at(&conn, POS, &req, now),
            Err(PosError::Validation(_))
        ));

        let mut req = open_req(-1.0);
        assert!(open_till_at(&conn, POS, &req, now).is_err());
        req.fondo_inicial = f64::NAN;
        assert!(open_till_at(&conn, POS, &req, now).is_err());

        let mut req = open_req(100.0);
        req.observaciones = Some("x".repeat(31));
        assert!(open_till_at(&conn, POS, &req, now).is_err());

        let mut req = open_req(100.0);
        req.descripcion_evento = Some("x".repeat(101));
        assert!(open_till_at(&conn, POS, &req, now).is_err());

        let mut req = open_req(100.0);
        req.disciplina = Some("RUGBY".into());
        assert!(open_till_at(&conn, POS, &req, now).is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM caja_diaria", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_close_persists_difference_identity() {
        let db = test_db();
        let till = {
            let conn = db.conn.lock().unwrap();
            open_till_at(&conn, POS, &open_req(1000.0), at("2025-03-01")).unwrap()
        };
        insert_ticket(&db, till.id, 1500.0, 1, "Impreso");
        insert_ticket(&db, till.id, 900.0, 2, "No impreso");
        insert_ticket(&db, till.id, 700.0, 1, "Anulado");
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO caja_movimiento (caja_id, tipo, monto) VALUES (?1, 'INGRESO', 300)",
                params![till.id],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO caja_movimiento (caja_id, tipo, monto) VALUES (?1, 'RETIRO', 200)",
                params![till.id],
            )
            .unwrap();
        }

        let outcome = close_till(&db, till.id, &close_req(2550.0, None), None).unwrap();
        let closed = &outcome.till;
        assert_eq!(closed.estado, TillState::Cerrada);
        assert_eq!(closed.total_ventas, Some(2400.0));
        assert_eq!(closed.transferencias_final, Some(900.0));
        assert_eq!(closed.total_tickets, Some(2));
        assert_eq!(closed.tickets_anulados, Some(1));
        assert_eq!(closed.usuario_cierre.as_deref(), Some("admin"));
        assert!(matches!(outcome.backup, BackupStatus::Skipped));

        let fondo = closed.fondo_inicial;
        let teorico = fondo + 2400.0 + 300.0 - 200.0;
        let expected = (closed.conteo_efectivo_final.unwrap() + closed.transferencias_final.unwrap())
            - teorico;
        assert_eq!(closed.diferencia, Some(round_money(expected)));
        assert_eq!(closed.diferencia, Some(-50.0));
        assert_eq!(closed.total_efectivo_teorico, Some(3500.0));
    }

    #[test]
    fn test_close_with_explicit_transfers() {
        let db = test_db();
        let till = {
            let conn = db.conn.lock().unwrap();
            open_till_at(&conn, POS, &open_req(0.0), at("2025-03-01")).unwrap()
        };
        insert_ticket(&db, till.id, 1000.0, 2, "Impreso");
        let outcome = close_till(&db, till.id, &close_req(0.0, Some(1200.0)), None).unwrap();
        assert_eq!(outcome.reconciliation.diferencia, 200.0);
    }

    #[test]
    fn test_close_is_terminal() {
        let db = test_db();
        let till = {
            let conn = db.conn.lock().unwrap();
            open_till_at(&conn, POS, &open_req(0.0), at("2025-03-01")).unwrap()
        };
        close_till(&db, till.id, &close_req(0.0, None), None).unwrap();
        let err = close_till(&db, till.id, &close_req(0.0, None), None).unwrap_err();
        assert!(matches!(err, PosError::InvalidState(_)));
        assert!(preview_close(&db, till.id, 0.0, None).is_err());
        assert!(current_till(&db, POS).unwrap().is_none());
    }

    #[test]
    fn test_close_requires_user_and_valid_count() {
        let db = test_db();
        let till = {
            let conn = db.conn.lock().unwrap();
            open_till_at(&conn, POS, &open_req(0.0), at("2025-03-01")).unwrap()
        };
        let mut req = close_req(10.0, None);
        req.usuario_cierre = " ".into();
        assert!(close_till(&db, till.id, &req, None).is_err());
        assert!(close_till(&db, till.id, &close_req(-5.0, None), None).is_err());
        assert!(get_till(&db, till.id).unwrap().is_open());
    }

    #[test]
    fn test_close_enqueues_cloud_sync_once() {
        let db = test_db();
        let till = {
            let conn = db.conn.lock().unwrap();
            open_till_at(&conn, POS, &open_req(0.0), at("2025-03-01")).unwrap()
        };
        close_till(&db, till.id, &close_req(0.0, None), None).unwrap();
        let conn = db.conn.lock().unwrap();
        let queued: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE entity_type = 'till' AND status = 'pending'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(queued, 1);
    }

    #[test]
    fn test_close_with_backup_dir_writes_copy() {
        let dir = tempfile::tempdir().unwrap();
        let db = db::init(dir.path()).unwrap();
        let till = open_till(&db, POS, &open_req(100.0)).unwrap();
        let outcome = close_till(
            &db,
            till.id,
            &close_req(100.0, None),
            Some(&dir.path().join("backup")),
        )
        .unwrap();
        match outcome.backup {
            BackupStatus::Saved { path } => assert!(path.exists()),
            other => panic!("expected saved backup, got {other:?}"),
        }
    }

    #[test]
    fn test_preview_matches_close() {
        let db = test_db();
        let till = {
            let conn = db.conn.lock().unwrap();
            open_till_at(&conn, POS, &open_req(500.0), at("2025-03-01")).unwrap()
        };
        insert_ticket(&db, till.id, 1200.0, 1, "Impreso");
        let preview = preview_close(&db, till.id, 1650.0, Some(0.0)).unwrap();
        let outcome = close_till(&db, till.id, &close_req(1650.0, Some(0.0)), None).unwrap();
        assert_eq!(preview.reconciliation, outcome.reconciliation);
        assert_eq!(outcome.reconciliation.diferencia, -50.0);
    }

    #[test]
    fn test_list_tills_filters_by_date() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            let a = open_till_at(&conn, POS, &open_req(0.0), at("2025-03-01")).unwrap();
            close_till_at(&conn, a.id, &close_req(0.0, None), at("2025-03-01")).unwrap();
            open_till_at(&conn, POS, &open_req(0.0), at("2025-03-02")).unwrap();
        }
        assert_eq!(list_tills(&db, None).unwrap().len(), 2);
        let day = list_tills(&db, Some("2025-03-01")).unwrap();
        assert_eq!(day.len(), 1);
        assert_eq!(day[0].fecha, "2025-03-01");
        assert!(list_tills(&db, Some("01/03/2025")).is_err());
        // latest first
        assert_eq!(list_tills(&db, None).unwrap()[0].fecha, "2025-03-02");
    }
}
