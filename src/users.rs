//! Local user accounts with bcrypt-hashed passwords.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};

#[cfg(not(test))]
const HASH_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const HASH_COST: u32 = 4;

const MIN_PASSWORD_LEN: usize = 4;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Administrador,
    Cajero,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Administrador => "administrador",
            Role::Cajero => "cajero",
        }
    }

    pub fn parse(raw: &str) -> PosResult<Self> {
        match raw.trim().to_lowercase().as_str() {
            "administrador" | "admin" => Ok(Role::Administrador),
            "cajero" => Ok(Role::Cajero),
            other => Err(PosError::validation(format!("unknown role '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub usuario: String,
    pub rol: Role,
}

fn hash_password(password: &str) -> PosResult<String> {
    bcrypt::hash(password, HASH_COST)
        .map_err(|e| PosError::Config(format!("Failed to hash password: {e}")))
}

fn insert_user(conn: &Connection, usuario: &str, password: &str, rol: Role) -> PosResult<i64> {
    let hash = hash_password(password)?;
    // Databases from older releases still carry a NOT NULL plain-text column.
    if db::column_exists(conn, "usuarios", "password")? {
        conn.execute(
            "INSERT INTO usuarios (usuario, password, password_hash, rol) VALUES (?1, '', ?2, ?3)",
            params![usuario, hash, rol.as_str()],
        )?;
    } else {
        conn.execute(
            "INSERT INTO usuarios (usuario, password_hash, rol) VALUES (?1, ?2, ?3)",
            params![usuario, hash, rol.as_str()],
        )?;
    }
    Ok(conn.last_insert_rowid())
}

pub fn create_user(db: &DbState, usuario: &str, password: &str, rol: Role) -> PosResult<User> {
    let usuario = usuario.trim();
    if usuario.is_empty() {
        return Err(PosError::validation("username cannot be empty"));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(PosError::validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    let conn = db.conn.lock()?;
    let id = db::with_write_tx(&conn, |conn| {
        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM usuarios WHERE usuario = ?1)",
            params![usuario],
            |r| r.get(0),
        )?;
        if taken {
            return Err(PosError::Conflict(format!("user {usuario} already exists")));
        }
        insert_user(conn, usuario, password, rol)
    })?;
    info!(user_id = id, usuario, rol = rol.as_str(), "User created");
    Ok(User {
        id,
        usuario: usuario.to_string(),
        rol,
    })
}

/// Check a username and password. Unknown users and wrong passwords fail
/// the same way.
pub fn authenticate(db: &DbState, usuario: &str, password: &str) -> PosResult<User> {
    let conn = db.conn.lock()?;
    let row: Option<(i64, String, Option<String>, String)> = conn
        .query_row(
            "SELECT id, usuario, password_hash, rol FROM usuarios WHERE usuario = ?1",
            params![usuario.trim()],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;

    let Some((id, usuario, hash, rol)) = row else {
        warn!("login failed");
        return Err(PosError::InvalidCredentials);
    };
    let valid = hash
        .as_deref()
        .map(|h| bcrypt::verify(password, h).unwrap_or(false))
        .unwrap_or(false);
    if !valid {
        warn!(usuario = %usuario, "login failed");
        return Err(PosError::InvalidCredentials);
    }
    info!(usuario = %usuario, "login successful");
    Ok(User {
        id,
        usuario,
        rol: Role::parse(&rol).unwrap_or(Role::Cajero),
    })
}

pub fn list_users(db: &DbState) -> PosResult<Vec<User>> {
    let conn = db.conn.lock()?;
    let mut stmt = conn.prepare("SELECT id, usuario, rol FROM usuarios ORDER BY usuario")?;
    let rows = stmt
        .query_map([], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .map(|(id, usuario, rol)| User {
            id,
            usuario,
            rol: Role::parse(&rol).unwrap_or(Role::Cajero),
        })
        .collect())
}

/// Seed the `admin` and `cajero` accounts when no user exists.
pub fn ensure_default_users(db: &DbState) -> PosResult<usize> {
    let conn = db.conn.lock()?;
    db::with_write_tx(&conn, |conn| {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM usuarios", [], |r| r.get(0))?;
        if count > 0 {
            return Ok(0);
        }
        insert_user(conn, "admin", "admin123", Role::Administrador)?;
        insert_user(conn, "cajero", "cajero123", Role::Cajero)?;
        info!("Seeded default users");
        Ok(2)
    })
}

/// Hash plain-text passwords left by older releases and blank them out.
pub fn upgrade_legacy_passwords(db: &DbState) -> PosResult<usize> {
    let conn = db.conn.lock()?;
    if !db::column_exists(&conn, "usuarios", "password")? {
        return Ok(0);
    }
    db::with_write_tx(&conn, |conn| {
        let legacy: Vec<(i64, String)> = {
            let mut stmt = conn.prepare(
                "SELECT id, password FROM usuarios
                 WHERE (password_hash IS NULL OR password_hash = '')
                   AND password IS NOT NULL AND password != ''",
            )?;
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for (id, plain) in &legacy {
            conn.execute(
                "UPDATE usuarios SET password_hash = ?2, password = '' WHERE id = ?1",
                params![id, hash_password(plain)?],
            )?;
        }
        if !legacy.is_empty() {
            info!(upgraded = legacy.len(), "Hashed legacy plain-text passwords");
        }
        Ok(legacy.len())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[test]
    fn test_default_users_seeded_once() {
        let db = test_db();
        assert_eq!(ensure_default_users(&db).unwrap(), 2);
        assert_eq!(ensure_default_users(&db).unwrap(), 0);
        let admin = authenticate(&db, "admin", "admin123").unwrap();
        assert_eq!(admin.rol, Role::Administrador);
        let cajero = authenticate(&db, "cajero", "cajero123").unwrap();
        assert_eq!(cajero.rol, Role::Cajero);
    }

    #[test]
    fn test_authentication_failures_look_alike() {
        let db = test_db();
        create_user(&db, "laura", "secreta", Role::Cajero).unwrap();
        let wrong = authenticate(&db, "laura", "otra").unwrap_err();
        let unknown = authenticate(&db, "nadie", "secreta").unwrap_err();
        assert_eq!(wrong.to_string(), unknown.to_string());
        assert!(matches!(wrong, PosError::InvalidCredentials));
    }

    #[test]
    fn test_passwords_are_not_stored_in_clear() {
        let db = test_db();
        create_user(&db, "laura", "secreta", Role::Cajero).unwrap();
        let conn = db.conn.lock().unwrap();
        let hash: String = conn
            .query_row("SELECT password_hash FROM usuarios WHERE usuario = 'laura'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_ne!(hash, "secreta");
        assert!(hash.starts_with("$2"));
    }

    #[test]
    fn test_create_user_validation() {
        let db = test_db();
        assert!(create_user(&db, " ", "secreta", Role::Cajero).is_err());
        assert!(create_user(&db, "laura", "123", Role::Cajero).is_err());
        create_user(&db, "laura", "secreta", Role::Cajero).unwrap();
        assert!(matches!(
            create_user(&db, "laura", "secreta", Role::Cajero),
            Err(PosError::Conflict(_))
        ));
        assert_eq!(list_users(&db).unwrap().len(), 1);
    }

    #[test]
    fn test_legacy_plain_passwords_are_upgraded() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE usuarios (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                usuario TEXT UNIQUE NOT NULL,
                password TEXT NOT NULL,
                rol TEXT NOT NULL
            );
            INSERT INTO usuarios (usuario, password, rol) VALUES ('admin', 'admin123', 'administrador');",
        )
        .unwrap();
        db::run_migrations_for_test(&conn);
        let db = DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        };

        assert_eq!(upgrade_legacy_passwords(&db).unwrap(), 1);
        assert_eq!(upgrade_legacy_passwords(&db).unwrap(), 0);
        authenticate(&db, "admin", "admin123").unwrap();
        // new accounts still work on the legacy table layout
        create_user(&db, "caja2", "clave", Role::Cajero).unwrap();
        authenticate(&db, "caja2", "clave").unwrap();
    }
}
