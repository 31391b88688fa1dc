//! Point-of-sale identity and till templates.
//!
//! Every till belongs to the POS that opened it. The POS identity is created
//! once per database and bound to this device's `device_id`; the
//! "one open till" rule is enforced per `pos_uuid`.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::config::{local_hostname, DeviceConfig};
use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};

const SETTINGS_CATEGORY: &str = "pos";
const SETTINGS_KEY_UUID: &str = "pos_uuid";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PosIdentity {
    pub pos_uuid: String,
    pub nombre: String,
    pub device_id: String,
    pub hostname: String,
}

/// A till template: the prefix used in till codes (e.g. `Caj01`).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TillTemplate {
    pub id: i64,
    pub descripcion: String,
    pub prefijo: String,
    pub predeterminada: bool,
}

// ---------------------------------------------------------------------------
// POS identity
// ---------------------------------------------------------------------------

/// Return this database's POS identity, creating it on first run and
/// refreshing its name and host name from the device config.
///
/// Tills written before POS identities existed are adopted by this POS.
pub fn ensure_local_pos(db: &DbState, cfg: &DeviceConfig) -> PosResult<PosIdentity> {
    let conn = db.conn.lock()?;
    db::with_write_tx(&conn, |conn| ensure_local_pos_conn(conn, cfg))
}

pub(crate) fn ensure_local_pos_conn(conn: &Connection, cfg: &DeviceConfig) -> PosResult<PosIdentity> {
    let hostname = local_hostname();
    let nombre = if cfg.device_name.trim().is_empty() {
        hostname.clone()
    } else {
        cfg.device_name.trim().to_string()
    };

    let pos_uuid = match existing_pos_uuid(conn, &cfg.device_id)? {
        Some(existing) => existing,
        None => {
            let fresh = Uuid::new_v4().to_string();
            db::set_setting(conn, SETTINGS_CATEGORY, SETTINGS_KEY_UUID, &fresh)?;
            info!(pos_uuid = %fresh, "Registered new point of sale");
            fresh
        }
    };

    conn.execute(
        "INSERT INTO pos (pos_uuid, nombre, device_id, hostname) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(pos_uuid) DO UPDATE SET
            nombre = excluded.nombre,
            device_id = excluded.device_id,
            hostname = excluded.hostname",
        params![pos_uuid, nombre, cfg.device_id, hostname],
    )?;

    let adopted = conn.execute(
        "UPDATE caja_diaria SET pos_uuid = ?1 WHERE pos_uuid IS NULL",
        params![pos_uuid],
    )?;
    if adopted > 0 {
        info!(pos_uuid = %pos_uuid, adopted, "Adopted legacy tills");
    }

    Ok(PosIdentity {
        pos_uuid,
        nombre,
        device_id: cfg.device_id.clone(),
        hostname,
    })
}

/// The POS uuid this device already owns: the local setting, else the `pos`
/// row registered for `device_id`, else the `device_pos_uuid` key that 2.0
/// databases keep in `settings`. A uuid found in the older places is written
/// back to the local setting.
fn existing_pos_uuid(conn: &Connection, device_id: &str) -> PosResult<Option<String>> {
    if let Some(uuid) = db::get_setting(conn, SETTINGS_CATEGORY, SETTINGS_KEY_UUID) {
        return Ok(Some(uuid));
    }

    let by_device = if device_id.trim().is_empty() {
        None
    } else {
        conn.query_row(
            "SELECT pos_uuid FROM pos WHERE device_id = ?1 ORDER BY rowid LIMIT 1",
            params![device_id.trim()],
            |r| r.get::<_, String>(0),
        )
        .optional()?
    };
    let found = match by_device {
        Some(uuid) => Some(uuid),
        None => legacy_settings_pos_uuid(conn)?,
    };

    if let Some(uuid) = &found {
        db::set_setting(conn, SETTINGS_CATEGORY, SETTINGS_KEY_UUID, uuid)?;
        info!(pos_uuid = %uuid, "Reusing point of sale registered by an earlier release");
    }
    Ok(found)
}

fn legacy_settings_pos_uuid(conn: &Connection) -> PosResult<Option<String>> {
    let has_table: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'settings')",
        [],
        |r| r.get(0),
    )?;
    if !has_table {
        return Ok(None);
    }
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM settings WHERE key = 'device_pos_uuid'",
            [],
            |r| r.get(0),
        )
        .optional()?;
    Ok(value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()))
}

// ---------------------------------------------------------------------------
// Till templates
// ---------------------------------------------------------------------------

fn template_from_row(row: &rusqlite::Row) -> rusqlite::Result<TillTemplate> {
    Ok(TillTemplate {
        id: row.get(0)?,
        descripcion: row.get(1)?,
        prefijo: row.get(2)?,
        predeterminada: row.get::<_, i64>(3)? != 0,
    })
}

pub fn list_templates(db: &DbState) -> PosResult<Vec<TillTemplate>> {
    let conn = db.conn.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, descripcion, prefijo, predeterminada FROM pos_cajas ORDER BY id",
    )?;
    let rows = stmt
        .query_map([], template_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Resolve a template by id, or the default one when `id` is `None`.
pub(crate) fn resolve_template(conn: &Connection, id: Option<i64>) -> PosResult<TillTemplate> {
    let found = match id {
        Some(id) => conn
            .query_row(
                "SELECT id, descripcion, prefijo, predeterminada FROM pos_cajas WHERE id = ?1",
                params![id],
                template_from_row,
            )
            .optional()?,
        None => conn
            .query_row(
                "SELECT id, descripcion, prefijo, predeterminada FROM pos_cajas
                 ORDER BY predeterminada DESC, id ASC LIMIT 1",
                [],
                template_from_row,
            )
            .optional()?,
    };
    found.ok_or_else(|| match id {
        Some(id) => PosError::not_found(format!("till template {id}")),
        None => PosError::Config("no till templates defined".into()),
    })
}

/// Add a template. Making it the default clears the flag on the others.
pub fn create_template(
    db: &DbState,
    descripcion: &str,
    prefijo: &str,
    predeterminada: bool,
) -> PosResult<TillTemplate> {
    let descripcion = descripcion.trim();
    let prefijo = prefijo.trim();
    if descripcion.is_empty() || prefijo.is_empty() {
        return Err(PosError::validation("template needs a description and a prefix"));
    }
    if prefijo.contains('-') || prefijo.chars().count() > 10 {
        return Err(PosError::validation(
            "prefix must be at most 10 characters without '-'",
        ));
    }

    let conn = db.conn.lock()?;
    db::with_write_tx(&conn, |conn| {
        let taken: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM pos_cajas WHERE prefijo = ?1)",
                params![prefijo],
                |r| r.get(0),
            )?;
        if taken {
            return Err(PosError::Conflict(format!("prefix {prefijo} already in use")));
        }
        if predeterminada {
            conn.execute("UPDATE pos_cajas SET predeterminada = 0", [])?;
        }
        conn.execute(
            "INSERT INTO pos_cajas (descripcion, prefijo, predeterminada) VALUES (?1, ?2, ?3)",
            params![descripcion, prefijo, predeterminada as i64],
        )?;
        Ok(TillTemplate {
            id: conn.last_insert_rowid(),
            descripcion: descripcion.to_string(),
            prefijo: prefijo.to_string(),
            predeterminada,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::till;
    use crate::till::tests::open_req;

    fn cfg() -> DeviceConfig {
        DeviceConfig {
            device_id: "dev-1".into(),
            device_name: "Cantina".into(),
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn test_pos_identity_is_stable() {
        let db = test_db();
        let first = ensure_local_pos(&db, &cfg()).unwrap();
        let second = ensure_local_pos(&db, &cfg()).unwrap();
        assert_eq!(first.pos_uuid, second.pos_uuid);
        assert_eq!(first.nombre, "Cantina");

        let conn = db.conn.lock().unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM pos", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_legacy_tills_are_adopted() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO caja_diaria (fecha, hora_apertura, fondo_inicial, estado)
                 VALUES ('2024-10-01', '09:00:00', 0, 'cerrada')",
                [],
            )
            .unwrap();
        }
        let pos = ensure_local_pos(&db, &cfg()).unwrap();
        let conn = db.conn.lock().unwrap();
        let owner: String = conn
            .query_row("SELECT pos_uuid FROM caja_diaria", [], |r| r.get(0))
            .unwrap();
        assert_eq!(owner, pos.pos_uuid);
    }

    #[test]
    fn test_pos_registered_by_device_is_reused() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO pos (pos_uuid, nombre, device_id, hostname)
                 VALUES ('old-pos', 'Caja vieja', 'dev-1', 'buffet-pc')",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO caja_diaria (fecha, hora_apertura, fondo_inicial, estado, pos_uuid, caja_uuid)
                 VALUES ('2025-03-01', '18:00:00', 1000, 'abierta', 'old-pos', 'caja-old')",
                [],
            )
            .unwrap();
        }

        let pos = ensure_local_pos(&db, &cfg()).unwrap();
        assert_eq!(pos.pos_uuid, "old-pos");
        assert!(till::current_till(&db, &pos.pos_uuid).unwrap().is_some());
        assert!(matches!(
            till::open_till(&db, &pos.pos_uuid, &open_req(0.0)),
            Err(PosError::Conflict(_))
        ));

        let conn = db.conn.lock().unwrap();
        assert_eq!(
            db::get_setting(&conn, SETTINGS_CATEGORY, SETTINGS_KEY_UUID).as_deref(),
            Some("old-pos")
        );
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM pos", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_pos_uuid_from_legacy_settings_table() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute_batch(
                "CREATE TABLE settings (key TEXT PRIMARY KEY, value TEXT NOT NULL);
                 INSERT INTO settings (key, value) VALUES ('device_pos_uuid', 'pos-20');",
            )
            .unwrap();
        }
        let pos = ensure_local_pos(&db, &cfg()).unwrap();
        assert_eq!(pos.pos_uuid, "pos-20");
        assert_eq!(ensure_local_pos(&db, &cfg()).unwrap().pos_uuid, "pos-20");
    }

    #[test]
    fn test_default_template_is_caj01() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        let t = resolve_template(&conn, None).unwrap();
        assert_eq!(t.prefijo, "Caj01");
        assert!(t.predeterminada);
        assert!(matches!(
            resolve_template(&conn, Some(999)),
            Err(PosError::NotFound(_))
        ));
    }

    #[test]
    fn test_create_template_moves_default() {
        let db = test_db();
        let t = create_template(&db, "Cantina", "Cant", true).unwrap();
        assert!(t.predeterminada);
        let all = list_templates(&db).unwrap();
        assert_eq!(all.iter().filter(|t| t.predeterminada).count(), 1);
        assert!(create_template(&db, "Otra", "Cant", false).is_err());
        assert!(create_template(&db, "Mala", "A-B", false).is_err());
    }
}
