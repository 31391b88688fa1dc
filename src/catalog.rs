//! Product catalog, categories, payment methods and disciplines.
//!
//! Stock rules: a product only moves stock when `contabiliza_stock = 1` and
//! its stock is not the infinite sentinel [`INFINITE_STOCK`]. Every stock
//! change is journaled in `stock_log`.

use chrono::Local;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};

/// Stock value meaning "never runs out".
pub const INFINITE_STOCK: i64 = 999;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Product {
    pub id: i64,
    pub codigo_producto: Option<String>,
    pub nombre: String,
    pub precio_compra: f64,
    pub precio_venta: f64,
    pub stock_actual: i64,
    pub stock_minimo: i64,
    pub categoria_id: Option<i64>,
    pub categoria: Option<String>,
    pub visible: bool,
    pub color: Option<String>,
    pub contabiliza_stock: bool,
}

impl Product {
    /// Whether sales and voids move this product's stock.
    pub fn moves_stock(&self) -> bool {
        self.contabiliza_stock && self.stock_actual != INFINITE_STOCK
    }

    pub fn below_minimum(&self) -> bool {
        self.moves_stock() && self.stock_actual <= self.stock_minimo
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProduct {
    pub codigo_producto: String,
    pub nombre: String,
    #[serde(default)]
    pub precio_compra: f64,
    pub precio_venta: f64,
    #[serde(default)]
    pub stock_actual: i64,
    #[serde(default = "default_stock_minimo")]
    pub stock_minimo: i64,
    pub categoria_id: Option<i64>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default = "default_true")]
    pub contabiliza_stock: bool,
}

fn default_stock_minimo() -> i64 {
    3
}
fn default_true() -> bool {
    true
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductUpdate {
    pub nombre: Option<String>,
    pub precio_compra: Option<f64>,
    pub precio_venta: Option<f64>,
    pub stock_minimo: Option<i64>,
    pub categoria_id: Option<i64>,
    pub color: Option<String>,
    pub contabiliza_stock: Option<bool>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Category {
    pub id: i64,
    pub descripcion: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PaymentMethod {
    pub id: i64,
    pub descripcion: String,
}

impl PaymentMethod {
    pub fn is_cash(&self) -> bool {
        is_cash_method(&self.descripcion)
    }
}

/// Cash is the "Efectivo" method; every other method counts as transfer.
pub fn is_cash_method(descripcion: &str) -> bool {
    descripcion.trim().to_lowercase().starts_with("efectivo")
}

/// How a caller names a payment method.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentMethodRef {
    Id(i64),
    Description(String),
}

impl From<&str> for PaymentMethodRef {
    fn from(raw: &str) -> Self {
        match raw.trim().parse::<i64>() {
            Ok(id) => PaymentMethodRef::Id(id),
            Err(_) => PaymentMethodRef::Description(raw.trim().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Discipline {
    pub codigo: String,
    pub descripcion: String,
}

// ---------------------------------------------------------------------------
// Products
// ---------------------------------------------------------------------------

const PRODUCT_COLUMNS: &str = "p.id, p.codigo_producto, p.nombre, p.precio_compra, p.precio_venta,
     COALESCE(p.stock_actual, 0), COALESCE(p.stock_minimo, 0), p.categoria_id, c.descripcion,
     COALESCE(p.visible, 1), p.color, COALESCE(p.contabiliza_stock, 1)";

fn product_from_row(row: &rusqlite::Row) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        codigo_producto: row.get(1)?,
        nombre: row.get(2)?,
        precio_compra: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
        precio_venta: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
        stock_actual: row.get(5)?,
        stock_minimo: row.get(6)?,
        categoria_id: row.get(7)?,
        categoria: row.get(8)?,
        visible: row.get::<_, i64>(9)? != 0,
        color: row.get(10)?,
        contabiliza_stock: row.get::<_, i64>(11)? != 0,
    })
}

pub fn list_products(db: &DbState, include_hidden: bool) -> PosResult<Vec<Product>> {
    let conn = db.conn.lock()?;
    let sql = format!(
        "SELECT {PRODUCT_COLUMNS}
         FROM products p LEFT JOIN Categoria_Producto c ON c.id = p.categoria_id
         WHERE ?1 = 1 OR COALESCE(p.visible, 1) = 1
         ORDER BY c.descripcion, p.nombre"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![include_hidden as i64], product_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn get_product_conn(conn: &Connection, id: i64) -> PosResult<Product> {
    let sql = format!(
        "SELECT {PRODUCT_COLUMNS}
         FROM products p LEFT JOIN Categoria_Producto c ON c.id = p.categoria_id
         WHERE p.id = ?1"
    );
    conn.query_row(&sql, params![id], product_from_row)
        .optional()?
        .ok_or_else(|| PosError::not_found(format!("product {id}")))
}

pub fn get_product(db: &DbState, id: i64) -> PosResult<Product> {
    let conn = db.conn.lock()?;
    get_product_conn(&conn, id)
}

pub fn create_product(db: &DbState, new: &NewProduct) -> PosResult<Product> {
    let codigo = new.codigo_producto.trim().to_uppercase();
    let nombre = new.nombre.trim();
    if codigo.is_empty() || nombre.is_empty() {
        return Err(PosError::validation("product needs a code and a name"));
    }
    if !new.precio_venta.is_finite() || new.precio_venta < 0.0 {
        return Err(PosError::validation("precio_venta must be a non-negative number"));
    }
    if !new.precio_compra.is_finite() || new.precio_compra < 0.0 {
        return Err(PosError::validation("precio_compra must be a non-negative number"));
    }
    if new.stock_actual < 0 {
        return Err(PosError::validation("stock cannot be negative"));
    }
    if new.stock_actual > INFINITE_STOCK {
        return Err(PosError::validation(format!(
            "stock above {INFINITE_STOCK} cannot be tracked"
        )));
    }

    let conn = db.conn.lock()?;
    let id = db::with_write_tx(&conn, |conn| {
        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM products WHERE UPPER(codigo_producto) = ?1)",
            params![codigo],
            |r| r.get(0),
        )?;
        if taken {
            return Err(PosError::Conflict(format!("product code {codigo} already exists")));
        }
        if let Some(cat) = new.categoria_id {
            ensure_category_exists(conn, cat)?;
        }
        conn.execute(
            "INSERT INTO products (codigo_producto, nombre, precio_compra, precio_venta,
                stock_actual, stock_minimo, categoria_id, visible, color, contabiliza_stock)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9)",
            params![
                codigo,
                nombre,
                new.precio_compra,
                new.precio_venta,
                new.stock_actual,
                new.stock_minimo,
                new.categoria_id,
                new.color,
                new.contabiliza_stock as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })?;

    info!(product_id = id, code = %codigo, "Product created");
    get_product_conn(&conn, id)
}

pub fn update_product(db: &DbState, id: i64, update: &ProductUpdate) -> PosResult<Product> {
    if let Some(nombre) = &update.nombre {
        if nombre.trim().is_empty() {
            return Err(PosError::validation("name cannot be empty"));
        }
    }
    for price in [update.precio_compra, update.precio_venta].into_iter().flatten() {
        if !price.is_finite() || price < 0.0 {
            return Err(PosError::validation("prices must be non-negative numbers"));
        }
    }

    let conn = db.conn.lock()?;
    db::with_write_tx(&conn, |conn| {
        get_product_conn(conn, id)?;
        if let Some(cat) = update.categoria_id {
            ensure_category_exists(conn, cat)?;
        }
        conn.execute(
            "UPDATE products SET
                nombre = COALESCE(?2, nombre),
                precio_compra = COALESCE(?3, precio_compra),
                precio_venta = COALESCE(?4, precio_venta),
                stock_minimo = COALESCE(?5, stock_minimo),
                categoria_id = COALESCE(?6, categoria_id),
                color = COALESCE(?7, color),
                contabiliza_stock = COALESCE(?8, contabiliza_stock)
             WHERE id = ?1",
            params![
                id,
                update.nombre.as_deref().map(str::trim),
                update.precio_compra,
                update.precio_venta,
                update.stock_minimo,
                update.categoria_id,
                update.color,
                update.contabiliza_stock.map(|b| b as i64),
            ],
        )?;
        Ok(())
    })?;
    get_product_conn(&conn, id)
}

pub fn set_visibility(db: &DbState, id: i64, visible: bool) -> PosResult<()> {
    let conn = db.conn.lock()?;
    let n = conn.execute(
        "UPDATE products SET visible = ?2 WHERE id = ?1",
        params![id, visible as i64],
    )?;
    if n == 0 {
        return Err(PosError::not_found(format!("product {id}")));
    }
    Ok(())
}

/// Manual stock correction (restock, shrinkage). Landing exactly on
/// [`INFINITE_STOCK`] is allowed and turns off stock movement; going past it
/// is not.
pub fn adjust_stock(db: &DbState, id: i64, delta: i64, motivo: &str) -> PosResult<Product> {
    if delta == 0 {
        return Err(PosError::validation("stock adjustment cannot be zero"));
    }
    let conn = db.conn.lock()?;
    db::with_write_tx(&conn, |conn| {
        let product = get_product_conn(conn, id)?;
        let new_stock = product.stock_actual + delta;
        if new_stock < 0 {
            return Err(PosError::InsufficientStock {
                product: product.nombre,
                available: product.stock_actual,
                requested: -delta,
            });
        }
        if new_stock > INFINITE_STOCK {
            return Err(PosError::validation(format!(
                "stock above {INFINITE_STOCK} cannot be tracked"
            )));
        }
        let motivo = if motivo.trim().is_empty() {
            "ajuste"
        } else {
            motivo.trim()
        };
        write_stock(conn, id, new_stock, delta, motivo)
    })?;
    get_product_conn(&conn, id)
}

/// Move a product's stock by `delta` when the product tracks stock. Returns
/// `false` when the product is untracked or infinite and nothing changed.
///
/// Sales and voids never land on [`INFINITE_STOCK`]: that would silently
/// stop tracking the product.
pub(crate) fn apply_stock_delta(
    conn: &Connection,
    product: &Product,
    delta: i64,
    motivo: &str,
) -> PosResult<bool> {
    if !product.moves_stock() || delta == 0 {
        return Ok(false);
    }
    // Re-read so several lines of the same product in one cart see each
    // other's deductions.
    let current: i64 = conn.query_row(
        "SELECT COALESCE(stock_actual, 0) FROM products WHERE id = ?1",
        params![product.id],
        |r| r.get(0),
    )?;
    let new_stock = current + delta;
    if new_stock < 0 {
        return Err(PosError::InsufficientStock {
            product: product.nombre.clone(),
            available: current,
            requested: -delta,
        });
    }
    if new_stock >= INFINITE_STOCK {
        warn!(product_id = product.id, current, delta, "Stock move would reach the untracked marker");
        return Err(PosError::validation(format!(
            "stock of {} would reach {INFINITE_STOCK}; adjust it manually first",
            product.nombre
        )));
    }
    write_stock(conn, product.id, new_stock, delta, motivo)?;
    Ok(true)
}

fn write_stock(conn: &Connection, id: i64, new_stock: i64, delta: i64, motivo: &str) -> PosResult<()> {
    conn.execute(
        "UPDATE products SET stock_actual = ?2 WHERE id = ?1",
        params![id, new_stock],
    )?;
    conn.execute(
        "INSERT INTO stock_log (producto_id, cantidad, fecha_hora, motivo) VALUES (?1, ?2, ?3, ?4)",
        params![
            id,
            delta,
            Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            motivo
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

pub fn list_categories(db: &DbState) -> PosResult<Vec<Category>> {
    let conn = db.conn.lock()?;
    let mut stmt = conn.prepare("SELECT id, descripcion FROM Categoria_Producto ORDER BY id")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(Category {
                id: r.get(0)?,
                descripcion: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn create_category(db: &DbState, descripcion: &str) -> PosResult<Category> {
    let descripcion = descripcion.trim();
    if descripcion.is_empty() {
        return Err(PosError::validation("category description cannot be empty"));
    }
    let conn = db.conn.lock()?;
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM Categoria_Producto WHERE LOWER(descripcion) = LOWER(?1)",
            params![descripcion],
            |r| r.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Err(PosError::Conflict(format!("category {descripcion} already exists")));
    }
    conn.execute(
        "INSERT INTO Categoria_Producto (descripcion) VALUES (?1)",
        params![descripcion],
    )?;
    Ok(Category {
        id: conn.last_insert_rowid(),
        descripcion: descripcion.to_string(),
    })
}

fn ensure_category_exists(conn: &Connection, id: i64) -> PosResult<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM Categoria_Producto WHERE id = ?1)",
        params![id],
        |r| r.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(PosError::not_found(format!("category {id}")))
    }
}

// ---------------------------------------------------------------------------
// Payment methods
// ---------------------------------------------------------------------------

pub fn list_payment_methods(db: &DbState) -> PosResult<Vec<PaymentMethod>> {
    let conn = db.conn.lock()?;
    let mut stmt = conn.prepare("SELECT id, descripcion FROM metodos_pago ORDER BY id")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(PaymentMethod {
                id: r.get(0)?,
                descripcion: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Resolve a payment method. An unknown id fails; an unknown description is
/// created on the fly.
pub(crate) fn resolve_payment_method(
    conn: &Connection,
    method: &PaymentMethodRef,
) -> PosResult<PaymentMethod> {
    match method {
        PaymentMethodRef::Id(id) => conn
            .query_row(
                "SELECT id, descripcion FROM metodos_pago WHERE id = ?1",
                params![id],
                |r| {
                    Ok(PaymentMethod {
                        id: r.get(0)?,
                        descripcion: r.get(1)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| PosError::not_found(format!("payment method {id}"))),
        PaymentMethodRef::Description(desc) => {
            let desc = desc.trim();
            if desc.is_empty() {
                return Err(PosError::validation("payment method cannot be empty"));
            }
            let existing = conn
                .query_row(
                    "SELECT id, descripcion FROM metodos_pago WHERE LOWER(descripcion) = LOWER(?1)",
                    params![desc],
                    |r| {
                        Ok(PaymentMethod {
                            id: r.get(0)?,
                            descripcion: r.get(1)?,
                        })
                    },
                )
                .optional()?;
            match existing {
                Some(m) => Ok(m),
                None => {
                    conn.execute(
                        "INSERT INTO metodos_pago (descripcion) VALUES (?1)",
                        params![desc],
                    )?;
                    info!(method = %desc, "Payment method created");
                    Ok(PaymentMethod {
                        id: conn.last_insert_rowid(),
                        descripcion: desc.to_string(),
                    })
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Disciplines
// ---------------------------------------------------------------------------

pub fn list_disciplines(db: &DbState) -> PosResult<Vec<Discipline>> {
    let conn = db.conn.lock()?;
    let mut stmt = conn.prepare("SELECT codigo, descripcion FROM disciplinas ORDER BY codigo")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(Discipline {
                codigo: r.get(0)?,
                descripcion: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn discipline_exists(conn: &Connection, codigo: &str) -> PosResult<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM disciplinas WHERE codigo = ?1)",
        params![codigo],
        |r| r.get(0),
    )?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::test_db;

    /// Insert a product straight into the table and return its id.
    pub(crate) fn insert_product(
        db: &DbState,
        codigo: &str,
        nombre: &str,
        precio: f64,
        stock: i64,
        tracked: bool,
    ) -> i64 {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO products (codigo_producto, nombre, precio_compra, precio_venta,
                stock_actual, stock_minimo, categoria_id, visible, contabiliza_stock)
             VALUES (?1, ?2, 0, ?3, ?4, 3, 2, 1, ?5)",
            params![codigo, nombre, precio, stock, tracked as i64],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    fn new_product(codigo: &str) -> NewProduct {
        NewProduct {
            codigo_producto: codigo.into(),
            nombre: "Choripan".into(),
            precio_compra: 800.0,
            precio_venta: 1500.0,
            stock_actual: 20,
            stock_minimo: 5,
            categoria_id: Some(1),
            color: None,
            contabiliza_stock: true,
        }
    }

    #[test]
    fn test_create_product_normalizes_code() {
        let db = test_db();
        let p = create_product(&db, &new_product("chori")).unwrap();
        assert_eq!(p.codigo_producto.as_deref(), Some("CHORI"));
        assert_eq!(p.categoria.as_deref(), Some("Comida"));
        assert!(matches!(
            create_product(&db, &new_product("CHORI")),
            Err(PosError::Conflict(_))
        ));
    }

    #[test]
    fn test_hidden_products_are_filtered() {
        let db = test_db();
        let id = insert_product(&db, "AGUA", "Agua", 500.0, 10, true);
        insert_product(&db, "COCA", "Coca", 900.0, 10, true);
        set_visibility(&db, id, false).unwrap();
        assert_eq!(list_products(&db, false).unwrap().len(), 1);
        assert_eq!(list_products(&db, true).unwrap().len(), 2);
    }

    #[test]
    fn test_update_product_is_partial() {
        let db = test_db();
        let id = insert_product(&db, "AGUA", "Agua", 500.0, 10, true);
        let p = update_product(
            &db,
            id,
            &ProductUpdate {
                precio_venta: Some(600.0),
                ..ProductUpdate::default()
            },
        )
        .unwrap();
        assert_eq!(p.precio_venta, 600.0);
        assert_eq!(p.nombre, "Agua");
    }

    #[test]
    fn test_adjust_stock_logs_and_rejects_negative() {
        let db = test_db();
        let id = insert_product(&db, "AGUA", "Agua", 500.0, 2, true);
        let p = adjust_stock(&db, id, 10, "reposicion").unwrap();
        assert_eq!(p.stock_actual, 12);
        assert!(matches!(
            adjust_stock(&db, id, -20, ""),
            Err(PosError::InsufficientStock { .. })
        ));
        let conn = db.conn.lock().unwrap();
        let logged: i64 = conn
            .query_row(
                "SELECT cantidad FROM stock_log WHERE producto_id = ?1",
                params![id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(logged, 10);
    }

    #[test]
    fn test_infinite_and_untracked_products_do_not_move() {
        let db = test_db();
        let inf = insert_product(&db, "PANCHO", "Pancho", 700.0, INFINITE_STOCK, true);
        let untracked = insert_product(&db, "CAFE", "Cafe", 400.0, 0, false);
        let conn = db.conn.lock().unwrap();
        for id in [inf, untracked] {
            let p = get_product_conn(&conn, id).unwrap();
            assert!(!apply_stock_delta(&conn, &p, -5, "venta").unwrap());
        }
        let p = get_product_conn(&conn, inf).unwrap();
        assert_eq!(p.stock_actual, INFINITE_STOCK);
    }

    #[test]
    fn test_tracked_stock_never_becomes_the_infinite_marker() {
        let db = test_db();
        let id = insert_product(&db, "HIELO", "Hielo", 300.0, 998, true);
        {
            let conn = db.conn.lock().unwrap();
            let p = get_product_conn(&conn, id).unwrap();
            assert!(matches!(
                apply_stock_delta(&conn, &p, 1, "anulacion"),
                Err(PosError::Validation(_))
            ));
            assert_eq!(get_product_conn(&conn, id).unwrap().stock_actual, 998);
            assert!(apply_stock_delta(&conn, &p, -1, "venta").unwrap());
        }
        assert!(matches!(
            adjust_stock(&db, id, 5, "reposicion"),
            Err(PosError::Validation(_))
        ));
        // an explicit correction onto the marker is still the way to stop tracking
        let p = adjust_stock(&db, id, 2, "sin control").unwrap();
        assert_eq!(p.stock_actual, INFINITE_STOCK);
        assert!(!p.moves_stock());

        let legacy = insert_product(&db, "VASO", "Vaso", 100.0, 1000, true);
        let conn = db.conn.lock().unwrap();
        let p = get_product_conn(&conn, legacy).unwrap();
        assert!(apply_stock_delta(&conn, &p, -1, "venta").is_err());
        assert_eq!(get_product_conn(&conn, legacy).unwrap().stock_actual, 1000);
    }

    #[test]
    fn test_payment_method_resolution() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        let cash = resolve_payment_method(&conn, &PaymentMethodRef::from("efectivo")).unwrap();
        assert_eq!(cash.id, 1);
        assert!(cash.is_cash());
        let by_id = resolve_payment_method(&conn, &PaymentMethodRef::from("2")).unwrap();
        assert_eq!(by_id.descripcion, "Transferencia");
        assert!(!by_id.is_cash());
        let created = resolve_payment_method(&conn, &PaymentMethodRef::from("Mercado Pago")).unwrap();
        assert_eq!(created.id, 3);
        assert!(resolve_payment_method(&conn, &PaymentMethodRef::Id(42)).is_err());
    }

    #[test]
    fn test_disciplines_seeded() {
        let db = test_db();
        let codes: Vec<String> = list_disciplines(&db)
            .unwrap()
            .into_iter()
            .map(|d| d.codigo)
            .collect();
        assert_eq!(codes, vec!["BAR", "FUTI", "FUTM", "PAT", "VOL"]);
        let conn = db.conn.lock().unwrap();
        assert!(discipline_exists(&conn, "BAR").unwrap());
        assert!(!discipline_exists(&conn, "RUGBY").unwrap());
    }

    #[test]
    fn test_categories() {
        let db = test_db();
        assert_eq!(list_categories(&db).unwrap().len(), 3);
        create_category(&db, "Postres").unwrap();
        assert!(create_category(&db, "postres").is_err());
    }
}
