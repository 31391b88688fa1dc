//! Local SQLite database layer for BuffetApp.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations (idempotent, so a
//! database created by an earlier BuffetApp release upgrades in place),
//! settings helpers, the error journal and the managed connection state
//! shared by every operation.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{PosError, PosResult};

/// Managed state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// File name of the local database inside the data directory.
pub const DB_FILE_NAME: &str = "barcancha.db";

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 4;

/// Initialize the database at `{data_dir}/barcancha.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations.
pub fn init(data_dir: &Path) -> PosResult<DbState> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = open_and_configure(&db_path)?;
    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Run [`init`] on a worker thread so the caller can keep going while the
/// schema is created or upgraded.
pub fn init_in_background(data_dir: PathBuf) -> JoinHandle<PosResult<DbState>> {
    std::thread::spawn(move || init(&data_dir))
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> PosResult<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run `f` inside `BEGIN IMMEDIATE ... COMMIT`, rolling back on any error.
pub(crate) fn with_write_tx<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> PosResult<T>,
) -> PosResult<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                error!("rollback failed: {rollback_err}");
            }
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }
    if current < 4 {
        migrate_v4(conn)?;
    }

    Ok(())
}

fn migration_failed(version: i32, e: rusqlite::Error) -> PosError {
    error!("Migration v{version} failed: {e}");
    PosError::Database(e)
}

/// Migration v1: settings, sync queue, error journal and the catalog.
fn migrate_v1(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- sync_queue (append-only)
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT UNIQUE NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER DEFAULT 0,
            last_error TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            synced_at TEXT
        );

        CREATE TABLE IF NOT EXISTS error_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fecha_hora TEXT,
            modulo TEXT,
            mensaje TEXT
        );

        CREATE TABLE IF NOT EXISTS metodos_pago (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            descripcion TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS Categoria_Producto (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            descripcion TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS disciplinas (
            codigo TEXT PRIMARY KEY,
            descripcion TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS products (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            codigo_producto TEXT,
            nombre TEXT NOT NULL,
            precio_compra INTEGER NOT NULL,
            precio_venta INTEGER NOT NULL,
            stock_actual INTEGER DEFAULT 0,
            stock_minimo INTEGER DEFAULT 3,
            categoria_id INTEGER,
            visible INTEGER DEFAULT 1,
            color TEXT,
            contabiliza_stock INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY (categoria_id) REFERENCES Categoria_Producto(id)
        );

        CREATE TABLE IF NOT EXISTS stock_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            producto_id INTEGER,
            cantidad INTEGER,
            fecha_hora TEXT NOT NULL,
            motivo TEXT,
            FOREIGN KEY(producto_id) REFERENCES products(id)
        );

        CREATE TABLE IF NOT EXISTS usuarios (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            usuario TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            rol TEXT NOT NULL CHECK (rol IN ('administrador','cajero'))
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key ON local_settings(setting_category, setting_key);
        ",
    )
    .map_err(|e| migration_failed(1, e))?;

    // Databases from older releases predate these product columns.
    for (column, ddl) in [
        ("codigo_producto", "ALTER TABLE products ADD COLUMN codigo_producto TEXT"),
        ("color", "ALTER TABLE products ADD COLUMN color TEXT"),
        (
            "contabiliza_stock",
            "ALTER TABLE products ADD COLUMN contabiliza_stock INTEGER NOT NULL DEFAULT 1",
        ),
    ] {
        if !column_exists(conn, "products", column)? {
            conn.execute_batch(ddl).map_err(|e| migration_failed(1, e))?;
        }
    }

    // Older releases stored plain-text passwords in `usuarios.password`;
    // users::upgrade_legacy_passwords hashes them on startup.
    if !column_exists(conn, "usuarios", "password_hash")? {
        conn.execute_batch("ALTER TABLE usuarios ADD COLUMN password_hash TEXT")
            .map_err(|e| migration_failed(1, e))?;
    }

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_products_codigo ON products(codigo_producto);

        INSERT INTO metodos_pago (descripcion)
            SELECT 'Efectivo' WHERE NOT EXISTS (SELECT 1 FROM metodos_pago);
        INSERT INTO metodos_pago (descripcion)
            SELECT 'Transferencia'
            WHERE NOT EXISTS (SELECT 1 FROM metodos_pago WHERE descripcion = 'Transferencia');

        INSERT INTO Categoria_Producto (descripcion)
            SELECT d FROM (SELECT 'Comida' AS d UNION ALL SELECT 'Bebida' UNION ALL SELECT 'Otros')
            WHERE NOT EXISTS (SELECT 1 FROM Categoria_Producto);

        INSERT OR IGNORE INTO disciplinas (codigo, descripcion) VALUES
            ('BAR', 'Buffet'),
            ('FUTI', 'Futbol Infantil'),
            ('FUTM', 'Futbol Mayor'),
            ('PAT', 'Patin'),
            ('VOL', 'Voley');

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| migration_failed(1, e))?;

    info!("Applied migration v1 (settings, catalog, users)");
    Ok(())
}

/// Till columns that databases from older releases may lack.
const LEGACY_TILL_COLUMNS: &[(&str, &str)] = &[
    ("codigo_caja", "TEXT"),
    ("disciplina", "TEXT"),
    ("usuario_apertura", "TEXT"),
    ("cajero_apertura", "TEXT"),
    ("apertura_dt", "TEXT"),
    ("observaciones_apertura", "TEXT"),
    ("descripcion_evento", "TEXT"),
    ("hora_cierre", "TEXT"),
    ("usuario_cierre", "TEXT"),
    ("cierre_dt", "TEXT"),
    ("total_ventas", "REAL"),
    ("total_efectivo_teorico", "REAL"),
    ("conteo_efectivo_final", "REAL"),
    ("transferencias_final", "REAL DEFAULT 0"),
    ("ingresos", "REAL DEFAULT 0"),
    ("retiros", "REAL DEFAULT 0"),
    ("diferencia", "REAL"),
    ("total_tickets", "INTEGER"),
    ("obs_cierre", "TEXT"),
];

/// Migration v2: tills and the cash movement ledger.
///
/// The till's `ingresos`/`retiros` are a cache of the ledger; the triggers
/// re-sum the ledger on every insert, update and delete.
fn migrate_v2(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS caja_diaria (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            codigo_caja TEXT,
            disciplina TEXT,
            fecha TEXT NOT NULL,
            usuario_apertura TEXT,
            cajero_apertura TEXT,
            hora_apertura TEXT NOT NULL,
            apertura_dt TEXT,
            fondo_inicial REAL NOT NULL,
            observaciones_apertura TEXT,
            descripcion_evento TEXT,
            estado TEXT NOT NULL CHECK (estado IN ('abierta','cerrada')),
            hora_cierre TEXT,
            usuario_cierre TEXT,
            cierre_dt TEXT,
            total_ventas REAL,
            total_efectivo_teorico REAL,
            conteo_efectivo_final REAL,
            transferencias_final REAL DEFAULT 0,
            ingresos REAL DEFAULT 0,
            retiros REAL DEFAULT 0,
            diferencia REAL,
            total_tickets INTEGER,
            obs_cierre TEXT
        );

        CREATE TABLE IF NOT EXISTS caja_movimiento (
            id INTEGER PRIMARY KEY,
            caja_id INTEGER NOT NULL,
            tipo TEXT NOT NULL CHECK (tipo IN ('INGRESO','RETIRO')),
            monto NUMERIC NOT NULL CHECK (monto > 0),
            observacion TEXT,
            creado_ts DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        ",
    )
    .map_err(|e| migration_failed(2, e))?;

    for (column, decl) in LEGACY_TILL_COLUMNS {
        if !column_exists(conn, "caja_diaria", column)? {
            conn.execute_batch(&format!("ALTER TABLE caja_diaria ADD COLUMN {column} {decl}"))
                .map_err(|e| migration_failed(2, e))?;
        }
    }

    drop_legacy_movement_uniqueness(conn)?;

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_caja_movimiento_caja ON caja_movimiento(caja_id);
        CREATE INDEX IF NOT EXISTS idx_caja_diaria_fecha ON caja_diaria(fecha);

        DROP TRIGGER IF EXISTS trg_caja_mov_insert;
        DROP TRIGGER IF EXISTS trg_caja_mov_delete;
        DROP TRIGGER IF EXISTS trg_caja_mov_update;

        CREATE TRIGGER trg_caja_mov_insert
        AFTER INSERT ON caja_movimiento
        BEGIN
            UPDATE caja_diaria SET
                ingresos = (SELECT COALESCE(SUM(monto), 0) FROM caja_movimiento
                            WHERE caja_id = NEW.caja_id AND tipo = 'INGRESO'),
                retiros  = (SELECT COALESCE(SUM(monto), 0) FROM caja_movimiento
                            WHERE caja_id = NEW.caja_id AND tipo = 'RETIRO')
            WHERE id = NEW.caja_id;
        END;

        CREATE TRIGGER trg_caja_mov_delete
        AFTER DELETE ON caja_movimiento
        BEGIN
            UPDATE caja_diaria SET
                ingresos = (SELECT COALESCE(SUM(monto), 0) FROM caja_movimiento
                            WHERE caja_id = OLD.caja_id AND tipo = 'INGRESO'),
                retiros  = (SELECT COALESCE(SUM(monto), 0) FROM caja_movimiento
                            WHERE caja_id = OLD.caja_id AND tipo = 'RETIRO')
            WHERE id = OLD.caja_id;
        END;

        -- Re-sums both the old and the new owner so moving a movement
        -- between tills keeps both caches right.
        CREATE TRIGGER trg_caja_mov_update
        AFTER UPDATE ON caja_movimiento
        BEGIN
            UPDATE caja_diaria SET
                ingresos = (SELECT COALESCE(SUM(monto), 0) FROM caja_movimiento
                            WHERE caja_id = caja_diaria.id AND tipo = 'INGRESO'),
                retiros  = (SELECT COALESCE(SUM(monto), 0) FROM caja_movimiento
                            WHERE caja_id = caja_diaria.id AND tipo = 'RETIRO')
            WHERE id IN (OLD.caja_id, NEW.caja_id);
        END;

        -- One-time normalization of caches written by older releases.
        UPDATE caja_diaria SET
            ingresos = (SELECT COALESCE(SUM(monto), 0) FROM caja_movimiento m
                        WHERE m.caja_id = caja_diaria.id AND m.tipo = 'INGRESO'),
            retiros  = (SELECT COALESCE(SUM(monto), 0) FROM caja_movimiento m
                        WHERE m.caja_id = caja_diaria.id AND m.tipo = 'RETIRO')
        WHERE EXISTS (SELECT 1 FROM caja_movimiento m WHERE m.caja_id = caja_diaria.id);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| migration_failed(2, e))?;

    info!("Applied migration v2 (tills + movement ledger)");
    Ok(())
}

/// Older releases declared `UNIQUE(caja_id, tipo)` on the ledger, which
/// allowed a single ingreso and a single retiro per till. Rebuild the table
/// without it.
fn drop_legacy_movement_uniqueness(conn: &Connection) -> PosResult<()> {
    let mut has_legacy_unique = false;
    {
        let mut stmt = conn.prepare("PRAGMA index_list('caja_movimiento')")?;
        let indexes: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i64>(2)?)))?
            .collect::<Result<_, _>>()?;
        for (name, unique) in indexes {
            if unique != 1 {
                continue;
            }
            let mut info = conn.prepare(&format!("PRAGMA index_info('{name}')"))?;
            let mut cols: Vec<String> = info
                .query_map([], |row| row.get::<_, String>(2))?
                .collect::<Result<_, _>>()?;
            cols.sort();
            if cols == ["caja_id", "tipo"] {
                has_legacy_unique = true;
            }
        }
    }

    if !has_legacy_unique {
        return Ok(());
    }

    warn!("Rebuilding caja_movimiento without legacy UNIQUE(caja_id, tipo)");
    conn.execute_batch(
        "
        CREATE TABLE caja_movimiento_new (
            id INTEGER PRIMARY KEY,
            caja_id INTEGER NOT NULL,
            tipo TEXT NOT NULL CHECK (tipo IN ('INGRESO','RETIRO')),
            monto NUMERIC NOT NULL CHECK (monto > 0),
            observacion TEXT,
            creado_ts DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        INSERT INTO caja_movimiento_new (id, caja_id, tipo, monto, observacion, creado_ts)
            SELECT id, caja_id, tipo, monto, observacion, creado_ts FROM caja_movimiento;
        DROP TABLE caja_movimiento;
        ALTER TABLE caja_movimiento_new RENAME TO caja_movimiento;
        ",
    )
    .map_err(|e| migration_failed(2, e))?;
    Ok(())
}

/// Migration v3: sales, tickets and line items.
fn migrate_v3(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS ventas (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fecha_hora TEXT NOT NULL,
            total_venta REAL NOT NULL,
            status TEXT DEFAULT 'No impreso',
            activo INTEGER DEFAULT 1,
            metodo_pago_id INTEGER,
            caja_id INTEGER,
            FOREIGN KEY (metodo_pago_id) REFERENCES metodos_pago(id),
            FOREIGN KEY (caja_id) REFERENCES caja_diaria(id)
        );

        CREATE TABLE IF NOT EXISTS tickets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            venta_id INTEGER,
            categoria_id INTEGER,
            producto_id INTEGER,
            fecha_hora TEXT NOT NULL,
            status TEXT DEFAULT 'No impreso',
            total_ticket REAL NOT NULL,
            identificador_ticket TEXT,
            FOREIGN KEY (venta_id) REFERENCES ventas(id),
            FOREIGN KEY (categoria_id) REFERENCES Categoria_Producto(id),
            FOREIGN KEY (producto_id) REFERENCES products(id)
        );

        CREATE TABLE IF NOT EXISTS venta_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ticket_id INTEGER,
            producto_id INTEGER,
            cantidad INTEGER,
            precio_unitario REAL,
            subtotal REAL,
            FOREIGN KEY (ticket_id) REFERENCES tickets(id),
            FOREIGN KEY (producto_id) REFERENCES products(id)
        );
        ",
    )
    .map_err(|e| migration_failed(3, e))?;

    if !column_exists(conn, "ventas", "caja_id")? {
        conn.execute_batch("ALTER TABLE ventas ADD COLUMN caja_id INTEGER REFERENCES caja_diaria(id)")
            .map_err(|e| migration_failed(3, e))?;
    }

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_ventas_fecha_hora ON ventas(fecha_hora);
        CREATE INDEX IF NOT EXISTS idx_ventas_caja ON ventas(caja_id);
        CREATE INDEX IF NOT EXISTS idx_tickets_venta_id ON tickets(venta_id);
        CREATE INDEX IF NOT EXISTS idx_tickets_categoria_id ON tickets(categoria_id);
        CREATE INDEX IF NOT EXISTS idx_venta_items_ticket_id ON venta_items(ticket_id);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| migration_failed(3, e))?;

    info!("Applied migration v3 (sales, tickets, line items)");
    Ok(())
}

/// Migration v4: point-of-sale identity, till templates, reconciliation
/// versioning and cloud-sync bookkeeping.
///
/// Replaces the global "one open till" index with one scoped to `pos_uuid`.
fn migrate_v4(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS pos (
            pos_uuid TEXT PRIMARY KEY,
            nombre TEXT NOT NULL,
            device_id TEXT,
            hostname TEXT,
            creado_ts TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS pos_cajas (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            descripcion TEXT NOT NULL,
            prefijo TEXT NOT NULL UNIQUE,
            predeterminada INTEGER NOT NULL DEFAULT 0
        );

        INSERT OR IGNORE INTO pos_cajas (descripcion, prefijo, predeterminada) VALUES
            ('Caja1', 'Caj01', 1),
            ('Caja2', 'Caj02', 0);
        ",
    )
    .map_err(|e| migration_failed(4, e))?;

    for (column, ddl) in [
        ("pos_uuid", "ALTER TABLE caja_diaria ADD COLUMN pos_uuid TEXT"),
        ("caja_uuid", "ALTER TABLE caja_diaria ADD COLUMN caja_uuid TEXT"),
        ("pos_caja_id", "ALTER TABLE caja_diaria ADD COLUMN pos_caja_id INTEGER"),
        ("caja_prefijo", "ALTER TABLE caja_diaria ADD COLUMN caja_prefijo TEXT"),
        (
            "ticket_seq",
            "ALTER TABLE caja_diaria ADD COLUMN ticket_seq INTEGER NOT NULL DEFAULT 0",
        ),
        (
            "tickets_anulados",
            "ALTER TABLE caja_diaria ADD COLUMN tickets_anulados INTEGER",
        ),
        (
            "total_transferencias",
            "ALTER TABLE caja_diaria ADD COLUMN total_transferencias REAL",
        ),
        // Rows written before this migration used the legacy formula.
        (
            "calculation_version",
            "ALTER TABLE caja_diaria ADD COLUMN calculation_version INTEGER NOT NULL DEFAULT 1",
        ),
        (
            "nube_enviado",
            "ALTER TABLE caja_diaria ADD COLUMN nube_enviado INTEGER NOT NULL DEFAULT 0",
        ),
        ("nube_uuid", "ALTER TABLE caja_diaria ADD COLUMN nube_uuid TEXT"),
        (
            "enviado_nube_ts",
            "ALTER TABLE caja_diaria ADD COLUMN enviado_nube_ts TEXT",
        ),
    ] {
        if !column_exists(conn, "caja_diaria", column)? {
            conn.execute_batch(ddl).map_err(|e| migration_failed(4, e))?;
        }
    }

    conn.execute_batch(
        "
        UPDATE caja_diaria SET caja_uuid = lower(hex(randomblob(16))) WHERE caja_uuid IS NULL;
        -- Open tills have no stored figures yet; they close under the current formula.
        UPDATE caja_diaria SET calculation_version = 2 WHERE estado = 'abierta';

        DROP INDEX IF EXISTS idx_caja_diaria_abierta;
        CREATE UNIQUE INDEX IF NOT EXISTS idx_caja_diaria_abierta_pos
            ON caja_diaria(pos_uuid) WHERE estado = 'abierta';
        CREATE UNIQUE INDEX IF NOT EXISTS idx_caja_diaria_uuid ON caja_diaria(caja_uuid);
        CREATE INDEX IF NOT EXISTS idx_caja_diaria_nube ON caja_diaria(estado, nube_enviado);

        INSERT INTO schema_version (version) VALUES (4);
        ",
    )
    .map_err(|e| migration_failed(4, e))?;

    info!("Applied migration v4 (POS identity, templates, sync bookkeeping)");
    Ok(())
}

pub(crate) fn column_exists(conn: &Connection, table: &str, column: &str) -> PosResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .optional()
    .unwrap_or_else(|e| {
        warn!(category, key, "get_setting failed: {e}");
        None
    })
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> PosResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Error journal
// ---------------------------------------------------------------------------

/// Append an entry to `error_log`. Never fails the caller.
pub fn record_error(conn: &Connection, module: &str, message: &str) {
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO error_log (fecha_hora, modulo, mensaje) VALUES (?1, ?2, ?3)",
        params![now, module, message],
    ) {
        warn!(module, "could not write error_log: {e}");
    }
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

/// In-memory database with every migration applied.
#[cfg(test)]
pub fn test_db() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .expect("pragma setup");
    run_migrations_for_test(&conn);
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
