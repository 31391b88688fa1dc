//! Manual cash movements ("ingresos" and "retiros") on an open till.
//!
//! The ledger is the source of truth; the till's `ingresos`/`retiros`
//! columns are kept in step by the triggers installed in migration v2.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};
use crate::till;

const MAX_NOTE_LEN: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum MovementKind {
    Ingreso,
    Retiro,
}

impl MovementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MovementKind::Ingreso => "INGRESO",
            MovementKind::Retiro => "RETIRO",
        }
    }

    pub fn parse(raw: &str) -> PosResult<Self> {
        match raw.trim().to_uppercase().as_str() {
            "INGRESO" | "IN" => Ok(MovementKind::Ingreso),
            "RETIRO" | "OUT" => Ok(MovementKind::Retiro),
            other => Err(PosError::validation(format!(
                "movement type must be INGRESO or RETIRO, got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Movement {
    pub id: i64,
    pub caja_id: i64,
    pub tipo: MovementKind,
    pub monto: f64,
    pub observacion: Option<String>,
    pub creado_ts: String,
}

fn movement_from_row(row: &rusqlite::Row) -> rusqlite::Result<Movement> {
    let raw: String = row.get(2)?;
    let tipo = if raw.eq_ignore_ascii_case("RETIRO") {
        MovementKind::Retiro
    } else {
        MovementKind::Ingreso
    };
    Ok(Movement {
        id: row.get(0)?,
        caja_id: row.get(1)?,
        tipo,
        monto: row.get(3)?,
        observacion: row.get(4)?,
        creado_ts: row.get(5)?,
    })
}

fn validate(monto: f64, observacion: Option<&str>) -> PosResult<Option<String>> {
    if !monto.is_finite() || monto <= 0.0 {
        return Err(PosError::validation("amount must be greater than zero"));
    }
    match observacion.map(str::trim).filter(|s| !s.is_empty()) {
        Some(note) if note.chars().count() > MAX_NOTE_LEN => Err(PosError::validation(format!(
            "note must be at most {MAX_NOTE_LEN} characters"
        ))),
        other => Ok(other.map(str::to_string)),
    }
}

fn ensure_till_open(conn: &Connection, caja_id: i64) -> PosResult<()> {
    let till = till::get_till_conn(conn, caja_id)?;
    if !till.is_open() {
        return Err(PosError::invalid_state(format!(
            "till {} is closed, movements cannot change",
            till.label()
        )));
    }
    Ok(())
}

fn get_movement_conn(conn: &Connection, id: i64) -> PosResult<Movement> {
    conn.query_row(
        "SELECT id, caja_id, tipo, monto, observacion, creado_ts FROM caja_movimiento WHERE id = ?1",
        params![id],
        movement_from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found(format!("movement {id}")))
}

pub fn record_movement(
    db: &DbState,
    caja_id: i64,
    tipo: MovementKind,
    monto: f64,
    observacion: Option<&str>,
) -> PosResult<Movement> {
    let observacion = validate(monto, observacion)?;
    let conn = db.conn.lock()?;
    let id = db::with_write_tx(&conn, |conn| {
        ensure_till_open(conn, caja_id)?;
        conn.execute(
            "INSERT INTO caja_movimiento (caja_id, tipo, monto, observacion) VALUES (?1, ?2, ?3, ?4)",
            params![caja_id, tipo.as_str(), monto, observacion],
        )?;
        Ok(conn.last_insert_rowid())
    })?;
    info!(caja_id, movement_id = id, tipo = tipo.as_str(), monto, "Cash movement recorded");
    get_movement_conn(&conn, id)
}

pub fn update_movement(
    db: &DbState,
    id: i64,
    tipo: MovementKind,
    monto: f64,
    observacion: Option<&str>,
) -> PosResult<Movement> {
    let observacion = validate(monto, observacion)?;
    let conn = db.conn.lock()?;
    db::with_write_tx(&conn, |conn| {
        let existing = get_movement_conn(conn, id)?;
        ensure_till_open(conn, existing.caja_id)?;
        conn.execute(
            "UPDATE caja_movimiento SET tipo = ?2, monto = ?3, observacion = ?4 WHERE id = ?1",
            params![id, tipo.as_str(), monto, observacion],
        )?;
        Ok(())
    })?;
    info!(movement_id = id, tipo = tipo.as_str(), monto, "Cash movement updated");
    get_movement_conn(&conn, id)
}

pub fn delete_movement(db: &DbState, id: i64) -> PosResult<()> {
    let conn = db.conn.lock()?;
    db::with_write_tx(&conn, |conn| {
        let existing = get_movement_conn(conn, id)?;
        ensure_till_open(conn, existing.caja_id)?;
        conn.execute("DELETE FROM caja_movimiento WHERE id = ?1", params![id])?;
        Ok(())
    })?;
    info!(movement_id = id, "Cash movement deleted");
    Ok(())
}

pub fn list_movements(db: &DbState, caja_id: i64) -> PosResult<Vec<Movement>> {
    let conn = db.conn.lock()?;
    list_movements_conn(&conn, caja_id)
}

pub(crate) fn list_movements_conn(conn: &Connection, caja_id: i64) -> PosResult<Vec<Movement>> {
    let mut stmt = conn.prepare(
        "SELECT id, caja_id, tipo, monto, observacion, creado_ts
         FROM caja_movimiento WHERE caja_id = ?1 ORDER BY creado_ts, id",
    )?;
    let rows = stmt
        .query_map(params![caja_id], movement_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
