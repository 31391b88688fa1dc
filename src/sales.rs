//! Checkout, ticket voiding and printed status.
//!
//! One sale (`ventas`) produces one ticket per sold unit, each with a single
//! `venta_items` row, because every unit is printed as its own voucher.

use std::collections::HashMap;

use chrono::{Local, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::catalog::{self, PaymentMethod, PaymentMethodRef};
use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};
use crate::till::{self, round_money};

pub const STATUS_NOT_PRINTED: &str = "No impreso";
pub const STATUS_PRINTED: &str = "Impreso";
pub const STATUS_VOIDED: &str = "Anulado";

#[derive(Debug, Clone, Deserialize)]
pub struct CartLine {
    pub product_id: i64,
    pub quantity: i64,
    /// Overrides the catalog price for this line.
    #[serde(default)]
    pub unit_price: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub lines: Vec<CartLine>,
    pub payment: PaymentMethodRef,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Ticket {
    pub id: i64,
    pub venta_id: i64,
    pub caja_id: Option<i64>,
    pub identificador: Option<String>,
    pub producto_id: Option<i64>,
    pub producto: Option<String>,
    pub categoria: Option<String>,
    pub metodo_pago: Option<String>,
    pub fecha_hora: String,
    pub total: f64,
    pub cantidad: i64,
    pub status: String,
}

impl Ticket {
    pub fn is_voided(&self) -> bool {
        self.status == STATUS_VOIDED
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Sale {
    pub venta_id: i64,
    pub caja_id: i64,
    pub total: f64,
    pub payment: PaymentMethod,
    pub tickets: Vec<Ticket>,
}

// ---------------------------------------------------------------------------
// Checkout
// ---------------------------------------------------------------------------

/// Ticket identifier: `{codigo_producto}-{DDMMYYYY}-{seq}`.
pub fn ticket_identifier(codigo: &str, at: NaiveDateTime, seq: i64) -> String {
    format!("{codigo}-{}-{seq}", at.format("%d%m%Y"))
}

/// Sell a cart on the POS's open till.
pub fn checkout(db: &DbState, pos_uuid: &str, req: &CheckoutRequest) -> PosResult<Sale> {
    let conn = db.conn.lock()?;
    checkout_at(&conn, pos_uuid, req, Local::now().naive_local())
}

pub(crate) fn checkout_at(
    conn: &Connection,
    pos_uuid: &str,
    req: &CheckoutRequest,
    now: NaiveDateTime,
) -> PosResult<Sale> {
    if req.lines.is_empty() {
        return Err(PosError::validation("cart is empty"));
    }
    for line in &req.lines {
        if line.quantity < 1 {
            return Err(PosError::validation("quantity must be at least 1"));
        }
        if let Some(price) = line.unit_price {
            if !price.is_finite() || price < 0.0 {
                return Err(PosError::validation("unit price must be a non-negative number"));
            }
        }
    }

    let fecha_hora = now.format("%Y-%m-%d %H:%M:%S").to_string();

    let (sale, ticket_ids) = db::with_write_tx(conn, |conn| {
        let till = till::current_till_conn(conn, pos_uuid)?
            .ok_or_else(|| PosError::invalid_state("no open till on this POS"))?;
        let payment = catalog::resolve_payment_method(conn, &req.payment)?;

        let mut priced = Vec::with_capacity(req.lines.len());
        for line in &req.lines {
            let product = catalog::get_product_conn(conn, line.product_id)?;
            let price = line.unit_price.unwrap_or(product.precio_venta);
            priced.push((product, line.quantity, price));
        }
        let total = round_money(
            priced
                .iter()
                .map(|(_, qty, price)| price * *qty as f64)
                .sum(),
        );

        conn.execute(
            "INSERT INTO ventas (fecha_hora, total_venta, status, activo, metodo_pago_id, caja_id)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)",
            params![fecha_hora, total, STATUS_NOT_PRINTED, payment.id, till.id],
        )?;
        let venta_id = conn.last_insert_rowid();

        let mut ticket_ids = Vec::new();
        for (product, qty, price) in &priced {
            catalog::apply_stock_delta(conn, product, -qty, "venta")?;
            let codigo = product
                .codigo_producto
                .clone()
                .unwrap_or_else(|| format!("P{}", product.id));

            for _ in 0..*qty {
                conn.execute(
                    "UPDATE caja_diaria SET ticket_seq = COALESCE(ticket_seq, 0) + 1 WHERE id = ?1",
                    params![till.id],
                )?;
                let seq: i64 = conn.query_row(
                    "SELECT ticket_seq FROM caja_diaria WHERE id = ?1",
                    params![till.id],
                    |r| r.get(0),
                )?;
                conn.execute(
                    "INSERT INTO tickets (venta_id, categoria_id, producto_id, fecha_hora, status,
                        total_ticket, identificador_ticket)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        venta_id,
                        product.categoria_id,
                        product.id,
                        fecha_hora,
                        STATUS_NOT_PRINTED,
                        price,
                        ticket_identifier(&codigo, now, seq),
                    ],
                )?;
                let ticket_id = conn.last_insert_rowid();
                conn.execute(
                    "INSERT INTO venta_items (ticket_id, producto_id, cantidad, precio_unitario, subtotal)
                     VALUES (?1, ?2, 1, ?3, ?3)",
                    params![ticket_id, product.id, price],
                )?;
                ticket_ids.push(ticket_id);
            }
        }

        Ok((
            Sale {
                venta_id,
                caja_id: till.id,
                total,
                payment,
                tickets: Vec::new(),
            },
            ticket_ids,
        ))
    })?;

    let mut sale = sale;
    sale.tickets = ticket_ids
        .iter()
        .map(|id| get_ticket_conn(conn, *id))
        .collect::<PosResult<Vec<_>>>()?;

    info!(
        venta_id = sale.venta_id,
        caja_id = sale.caja_id,
        total = sale.total,
        tickets = sale.tickets.len(),
        metodo = %sale.payment.descripcion,
        "Sale recorded"
    );
    Ok(sale)
}

// ---------------------------------------------------------------------------
// Tickets
// ---------------------------------------------------------------------------

const TICKET_SELECT: &str = "SELECT t.id, t.venta_id, v.caja_id, t.identificador_ticket, t.producto_id,
        p.nombre, c.descripcion, mp.descripcion, t.fecha_hora, t.total_ticket,
        COALESCE((SELECT SUM(vi.cantidad) FROM venta_items vi WHERE vi.ticket_id = t.id), 1),
        COALESCE(t.status, 'No impreso')
     FROM tickets t
     JOIN ventas v ON v.id = t.venta_id
     LEFT JOIN products p ON p.id = t.producto_id
     LEFT JOIN Categoria_Producto c ON c.id = t.categoria_id
     LEFT JOIN metodos_pago mp ON mp.id = v.metodo_pago_id";

fn ticket_from_row(row: &rusqlite::Row) -> rusqlite::Result<Ticket> {
    Ok(Ticket {
        id: row.get(0)?,
        venta_id: row.get(1)?,
        caja_id: row.get(2)?,
        identificador: row.get(3)?,
        producto_id: row.get(4)?,
        producto: row.get(5)?,
        categoria: row.get(6)?,
        metodo_pago: row.get(7)?,
        fecha_hora: row.get(8)?,
        total: row.get(9)?,
        cantidad: row.get(10)?,
        status: row.get(11)?,
    })
}

pub(crate) fn get_ticket_conn(conn: &Connection, id: i64) -> PosResult<Ticket> {
    conn.query_row(
        &format!("{TICKET_SELECT} WHERE t.id = ?1"),
        params![id],
        ticket_from_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found(format!("ticket {id}")))
}

pub fn get_ticket(db: &DbState, id: i64) -> PosResult<Ticket> {
    let conn = db.conn.lock()?;
    get_ticket_conn(&conn, id)
}

/// Tickets of a till, oldest first.
pub fn list_tickets(db: &DbState, caja_id: i64) -> PosResult<Vec<Ticket>> {
    let conn = db.conn.lock()?;
    list_tickets_conn(&conn, caja_id)
}

pub(crate) fn list_tickets_conn(conn: &Connection, caja_id: i64) -> PosResult<Vec<Ticket>> {
    let mut stmt = conn.prepare(&format!(
        "{TICKET_SELECT} WHERE v.caja_id = ?1 ORDER BY t.id"
    ))?;
    let rows = stmt
        .query_map(params![caja_id], ticket_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Void a ticket of an open till and put its units back in stock.
pub fn void_ticket(db: &DbState, ticket_id: i64) -> PosResult<Ticket> {
    let conn = db.conn.lock()?;
    db::with_write_tx(&conn, |conn| {
        let ticket = get_ticket_conn(conn, ticket_id)?;
        if ticket.is_voided() {
            return Err(PosError::invalid_state(format!(
                "ticket {ticket_id} is already voided"
            )));
        }
        let caja_id = ticket
            .caja_id
            .ok_or_else(|| PosError::invalid_state(format!("ticket {ticket_id} has no till")))?;
        let till = till::get_till_conn(conn, caja_id)?;
        if !till.is_open() {
            return Err(PosError::invalid_state(format!(
                "till {} is closed, its tickets cannot be voided",
                till.label()
            )));
        }

        conn.execute(
            "UPDATE tickets SET status = ?2 WHERE id = ?1",
            params![ticket_id, STATUS_VOIDED],
        )?;

        let mut restore: HashMap<i64, i64> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT producto_id, COALESCE(cantidad, 0) FROM venta_items
                 WHERE ticket_id = ?1 AND producto_id IS NOT NULL",
            )?;
            let items = stmt.query_map(params![ticket_id], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
            })?;
            for item in items {
                let (product_id, qty) = item?;
                *restore.entry(product_id).or_default() += qty;
            }
        }
        for (product_id, qty) in restore {
            match catalog::get_product_conn(conn, product_id) {
                Ok(product) => {
                    catalog::apply_stock_delta(conn, &product, qty, "anulacion")?;
                }
                Err(PosError::NotFound(_)) => {
                    warn!(ticket_id, product_id, "Voided ticket references a deleted product");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    })?;

    info!(ticket_id, "Ticket voided");
    get_ticket_conn(&conn, ticket_id)
}

/// Mark tickets as printed. Voided and already printed tickets are left
/// alone; returns how many changed.
pub fn mark_printed(db: &DbState, ticket_ids: &[i64]) -> PosResult<usize> {
    if ticket_ids.is_empty() {
        return Ok(0);
    }
    let conn = db.conn.lock()?;
    db::with_write_tx(&conn, |conn| {
        let mut changed = 0;
        for id in ticket_ids {
            changed += conn.execute(
                "UPDATE tickets SET status = ?2 WHERE id = ?1 AND COALESCE(status, ?3) = ?3",
                params![id, STATUS_PRINTED, STATUS_NOT_PRINTED],
            )?;
        }
        Ok(changed)
    })
}
