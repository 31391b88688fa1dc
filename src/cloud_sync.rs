//! Mirror of closed tills to a Supabase-compatible REST backend.
//!
//! Closing a till enqueues a `sync_queue` row in the same transaction. The
//! queue is drained on demand by [`sync_pending`]; there is no background
//! loop. Uploads are upserts keyed by the till's cloud `uuid`, so sending a
//! till twice is harmless.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Local;
use reqwest::{Client, StatusCode};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};
use crate::storage::CloudCredentials;
use crate::till::{self, Till};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const ITEM_BATCH: usize = 500;
const PRODUCT_LOOKUP_BATCH: usize = 100;
const PRODUCT_INSERT_BATCH: usize = 200;
/// Tills processed per [`sync_pending`] run unless the caller says otherwise.
pub const DEFAULT_PENDING_LIMIT: usize = 20;

const ENTITY_TILL: &str = "till";
const OP_CLOSE: &str = "close";

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

pub fn idempotency_key(caja_uuid: &str) -> String {
    format!("till:close:{caja_uuid}")
}

/// Queue a closed till for upload. Returns `false` when it was already
/// queued.
pub(crate) fn enqueue_till(conn: &Connection, till: &Till) -> PosResult<bool> {
    let caja_uuid = till
        .caja_uuid
        .clone()
        .ok_or_else(|| PosError::invalid_state(format!("till {} has no uuid", till.label())))?;
    let payload = json!({
        "caja_id": till.id,
        "caja_uuid": caja_uuid,
        "codigo_caja": till.codigo_caja,
    });
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            ENTITY_TILL,
            till.id.to_string(),
            OP_CLOSE,
            payload.to_string(),
            idempotency_key(&caja_uuid)
        ],
    )?;
    Ok(inserted > 0)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueueEntry {
    pub id: i64,
    pub caja_id: i64,
    pub status: String,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub created_at: Option<String>,
}

/// Till uploads that have not gone through yet, newest till first.
pub fn pending_queue(db: &DbState) -> PosResult<Vec<QueueEntry>> {
    let conn = db.conn.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, CAST(entity_id AS INTEGER), status, COALESCE(retry_count, 0), last_error, created_at
         FROM sync_queue
         WHERE entity_type = ?1 AND status != 'synced'
         ORDER BY CAST(entity_id AS INTEGER) DESC",
    )?;
    let rows = stmt
        .query_map(params![ENTITY_TILL], |r| {
            Ok(QueueEntry {
                id: r.get(0)?,
                caja_id: r.get(1)?,
                status: r.get(2)?,
                retry_count: r.get(3)?,
                last_error: r.get(4)?,
                created_at: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Queue every closed, unsent till that has no queue row yet (tills closed
/// before the queue existed).
fn backfill_queue(conn: &Connection) -> PosResult<usize> {
    let mut stmt = conn.prepare(
        "SELECT id FROM caja_diaria
         WHERE estado = 'cerrada' AND COALESCE(nube_enviado, 0) = 0
           AND NOT EXISTS (
               SELECT 1 FROM sync_queue q
               WHERE q.entity_type = ?1 AND q.entity_id = CAST(caja_diaria.id AS TEXT)
           )",
    )?;
    let ids = stmt
        .query_map(params![ENTITY_TILL], |r| r.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut queued = 0;
    for id in ids {
        let till = till::get_till_conn(conn, id)?;
        if enqueue_till(conn, &till)? {
            queued += 1;
        }
    }
    Ok(queued)
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Header row for the remote `cajas` table.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TillHeader {
    pub uuid: String,
    pub caja_local_id: i64,
    pub codigo_caja: Option<String>,
    pub fecha_apertura: Option<String>,
    pub fecha_cierre: Option<String>,
    pub usuario_apertura: Option<String>,
    pub usuario_cierre: Option<String>,
    pub cajero_apertura: Option<String>,
    pub fondo_inicial: f64,
    pub total_ventas: f64,
    pub total_efectivo_teorico: f64,
    pub conteo_efectivo_final: f64,
    pub transferencias_final: f64,
    pub ingresos: f64,
    pub retiros: f64,
    pub diferencia: f64,
    pub total_tickets: i64,
    pub observaciones_apertura: Option<String>,
    pub obs_cierre: Option<String>,
    pub descripcion_evento: Option<String>,
    pub disciplina: Option<String>,
}

/// One sold line for the remote `caja_items` table.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TillItem {
    pub caja_uuid: String,
    pub ticket_id: i64,
    pub fecha: String,
    pub producto_id: i64,
    pub producto_nombre: String,
    pub categoria: Option<String>,
    pub cantidad: i64,
    pub precio_unitario: f64,
    pub total: f64,
    pub metodo_pago: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteProduct {
    pub codigo_producto: String,
    pub nombre: String,
    pub precio_venta: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TillPayload {
    pub header: TillHeader,
    pub items: Vec<TillItem>,
    /// Products referenced by the items, keyed by upper-case code.
    pub products: BTreeMap<String, RemoteProduct>,
    pub tickets: usize,
}

fn joined_dt(fecha: &str, hora: Option<&str>) -> Option<String> {
    match hora {
        Some(h) if !h.is_empty() => Some(format!("{fecha} {h}")),
        _ if fecha.is_empty() => None,
        _ => Some(fecha.to_string()),
    }
}

/// Assemble what gets uploaded for a closed till.
pub fn build_payload(conn: &Connection, till_id: i64) -> PosResult<TillPayload> {
    let till = till::get_till_conn(conn, till_id)?;
    if till.is_open() {
        return Err(PosError::invalid_state(format!(
            "till {} is still open",
            till.label()
        )));
    }
    let uuid = till
        .nube_uuid
        .clone()
        .or_else(|| till.caja_uuid.clone())
        .ok_or_else(|| PosError::invalid_state(format!("till {} has no uuid", till.label())))?;

    let header = TillHeader {
        uuid: uuid.clone(),
        caja_local_id: till.id,
        codigo_caja: till.codigo_caja.clone(),
        fecha_apertura: till
            .apertura_dt
            .clone()
            .or_else(|| joined_dt(&till.fecha, Some(&till.hora_apertura))),
        fecha_cierre: till
            .cierre_dt
            .clone()
            .or_else(|| joined_dt(&till.fecha, till.hora_cierre.as_deref())),
        usuario_apertura: till.usuario_apertura.clone(),
        usuario_cierre: till.usuario_cierre.clone(),
        cajero_apertura: till.cajero_apertura.clone(),
        fondo_inicial: till.fondo_inicial,
        total_ventas: till.total_ventas.unwrap_or(0.0),
        total_efectivo_teorico: till.total_efectivo_teorico.unwrap_or(0.0),
        conteo_efectivo_final: till.conteo_efectivo_final.unwrap_or(0.0),
        transferencias_final: till.transferencias_final.unwrap_or(0.0),
        ingresos: till.ingresos,
        retiros: till.retiros,
        diferencia: till.diferencia.unwrap_or(0.0),
        total_tickets: till.total_tickets.unwrap_or(0),
        observaciones_apertura: till.observaciones_apertura.clone(),
        obs_cierre: till.obs_cierre.clone(),
        descripcion_evento: till.descripcion_evento.clone(),
        disciplina: till.disciplina.clone(),
    };

    let mut stmt = conn.prepare(
        "SELECT t.id, t.fecha_hora, p.id, p.nombre, p.codigo_producto, c.descripcion,
                COALESCE(vi.cantidad, 0), COALESCE(vi.precio_unitario, 0), mp.descripcion
         FROM venta_items vi
         JOIN tickets t ON t.id = vi.ticket_id
         JOIN ventas v ON v.id = t.venta_id
         LEFT JOIN metodos_pago mp ON mp.id = v.metodo_pago_id
         JOIN products p ON p.id = vi.producto_id
         LEFT JOIN Categoria_Producto c ON c.id = p.categoria_id
         WHERE v.caja_id = ?1 AND COALESCE(t.status, '') != 'Anulado'
         ORDER BY t.id, vi.id",
    )?;
    let rows = stmt
        .query_map(params![till_id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, Option<String>>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, i64>(6)?,
                r.get::<_, f64>(7)?,
                r.get::<_, Option<String>>(8)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut items = Vec::with_capacity(rows.len());
    let mut products = BTreeMap::new();
    let mut tickets = std::collections::BTreeSet::new();
    for (ticket_id, fecha, producto_id, nombre, codigo, categoria, cantidad, precio, metodo) in rows
    {
        if let Some(code) = codigo.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            let code = code.to_uppercase();
            products.entry(code.clone()).or_insert_with(|| RemoteProduct {
                codigo_producto: code,
                nombre: nombre.clone(),
                precio_venta: precio,
            });
        }
        tickets.insert(ticket_id);
        items.push(TillItem {
            caja_uuid: uuid.clone(),
            ticket_id,
            fecha,
            producto_id,
            producto_nombre: nombre,
            categoria,
            cantidad,
            precio_unitario: precio,
            total: till::round_money(cantidad as f64 * precio),
            metodo_pago: metodo,
        });
    }

    Ok(TillPayload {
        header,
        items,
        products,
        tickets: tickets.len(),
    })
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach cloud backend at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid cloud backend URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

fn status_error(table: &str, status: StatusCode, body: &str) -> String {
    let hint = match status.as_u16() {
        401 | 403 => "anon key rejected",
        404 => "table not found",
        s if s >= 500 => "server error",
        _ => "request rejected",
    };
    let body = body.trim();
    if body.is_empty() {
        format!("{table}: {hint} (HTTP {})", status.as_u16())
    } else {
        format!("{table}: {hint} (HTTP {}): {body}", status.as_u16())
    }
}

pub struct CloudClient {
    http: Client,
    rest_url: String,
    anon_key: String,
}

impl CloudClient {
    pub fn new(creds: &CloudCredentials) -> PosResult<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PosError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            rest_url: format!("{}/rest/v1", creds.url.trim_end_matches('/')),
            anon_key: creds.anon_key.clone(),
        })
    }

    /// Build a client, failing with a configuration error when no endpoint
    /// is set up.
    pub fn from_credentials(creds: Option<CloudCredentials>) -> PosResult<Self> {
        let creds = creds.ok_or_else(|| {
            PosError::Config("cloud sync not configured (SUPABASE_URL / SUPABASE_ANON_KEY)".into())
        })?;
        Self::new(&creds)
    }

    fn request(&self, method: reqwest::Method, table: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}/{table}", self.rest_url))
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.anon_key))
            .header("Prefer", "return=representation,resolution=merge-duplicates")
    }

    async fn post<T: Serialize>(&self, table: &str, rows: &[T]) -> PosResult<()> {
        let resp = self
            .request(reqwest::Method::POST, table)
            .json(rows)
            .send()
            .await
            .map_err(|e| PosError::Remote(friendly_error(&self.rest_url, &e)))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PosError::Remote(status_error(table, status, &body)));
        }
        Ok(())
    }

    async fn existing_product_codes(&self, codes: &[String]) -> PosResult<Vec<String>> {
        let mut found = Vec::new();
        for chunk in codes.chunks(PRODUCT_LOOKUP_BATCH) {
            let values = chunk
                .iter()
                .map(|c| format!("\"{c}\""))
                .collect::<Vec<_>>()
                .join(",");
            let resp = self
                .request(reqwest::Method::GET, "products")
                .query(&[
                    ("select", "codigo_producto".to_string()),
                    ("codigo_producto", format!("in.({values})")),
                ])
                .send()
                .await
                .map_err(|e| PosError::Remote(friendly_error(&self.rest_url, &e)))?;
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(PosError::Remote(status_error("products", status, &body)));
            }
            if body.trim().is_empty() {
                continue;
            }
            let rows: Vec<Value> = serde_json::from_str(&body)?;
            found.extend(rows.iter().filter_map(|row| {
                row.get("codigo_producto")
                    .and_then(Value::as_str)
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty())
            }));
        }
        Ok(found)
    }

    /// Insert the products the backend does not know yet. Returns how many
    /// were inserted.
    async fn ensure_remote_products(
        &self,
        products: &BTreeMap<String, RemoteProduct>,
    ) -> PosResult<usize> {
        if products.is_empty() {
            return Ok(0);
        }
        let codes: Vec<String> = products.keys().cloned().collect();
        let existing = self.existing_product_codes(&codes).await?;
        let missing: Vec<&RemoteProduct> = products
            .iter()
            .filter(|(code, _)| !existing.contains(code))
            .map(|(_, p)| p)
            .collect();
        let mut inserted = 0;
        for chunk in missing.chunks(PRODUCT_INSERT_BATCH) {
            self.post("products", chunk).await?;
            inserted += chunk.len();
        }
        Ok(inserted)
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub caja_id: i64,
    pub uuid: String,
    pub codigo_caja: Option<String>,
    pub items_subidos: usize,
    pub tickets_subidos: usize,
    pub new_products: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub productos_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingResult {
    pub caja_id: i64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SyncOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Upload one closed till: products first (failures are reported, not
/// fatal), then the header, then the items in batches.
pub async fn sync_till(db: &DbState, client: &CloudClient, till_id: i64) -> PosResult<SyncOutcome> {
    let payload = {
        let conn = db.conn.lock()?;
        build_payload(&conn, till_id)?
    };

    let (new_products, productos_error) = match client.ensure_remote_products(&payload.products).await
    {
        Ok(n) => (n, None),
        Err(e) => {
            warn!(till_id, "Remote product check failed: {e}");
            (0, Some(e.to_string()))
        }
    };

    client.post("cajas", std::slice::from_ref(&payload.header)).await?;
    for batch in payload.items.chunks(ITEM_BATCH) {
        client.post("caja_items", batch).await?;
    }

    let uuid = payload.header.uuid.clone();
    {
        let conn = db.conn.lock()?;
        let caja_uuid = till::get_till_conn(&conn, till_id)?.caja_uuid;
        db::with_write_tx(&conn, |conn| {
            conn.execute(
                "UPDATE caja_diaria SET nube_enviado = 1, nube_uuid = ?2, enviado_nube_ts = ?3
                 WHERE id = ?1",
                params![
                    till_id,
                    uuid,
                    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
                ],
            )?;
            if let Some(caja_uuid) = &caja_uuid {
                conn.execute(
                    "UPDATE sync_queue SET status = 'synced', last_error = NULL,
                        synced_at = datetime('now'), updated_at = datetime('now')
                     WHERE idempotency_key = ?1",
                    params![idempotency_key(caja_uuid)],
                )?;
            }
            Ok(())
        })?;
    }

    info!(
        till_id,
        uuid = %uuid,
        items = payload.items.len(),
        tickets = payload.tickets,
        new_products,
        "Till synced to cloud"
    );
    Ok(SyncOutcome {
        caja_id: till_id,
        uuid,
        codigo_caja: payload.header.codigo_caja,
        items_subidos: payload.items.len(),
        tickets_subidos: payload.tickets,
        new_products,
        productos_error,
    })
}

fn record_failure(db: &DbState, queue_id: i64, till_id: i64, error: &str) -> PosResult<()> {
    let conn = db.conn.lock()?;
    conn.execute(
        "UPDATE sync_queue SET status = 'pending', retry_count = COALESCE(retry_count, 0) + 1,
            last_error = ?2, updated_at = datetime('now')
         WHERE id = ?1",
        params![queue_id, error],
    )?;
    db::record_error(&conn, "cloud_sync", &format!("till {till_id}: {error}"));
    Ok(())
}

/// Upload queued tills, newest first, at most `limit` per call.
pub async fn sync_pending(
    db: &DbState,
    client: &CloudClient,
    limit: usize,
) -> PosResult<Vec<PendingResult>> {
    let queue: Vec<(i64, i64)> = {
        let conn = db.conn.lock()?;
        let backfilled = db::with_write_tx(&conn, backfill_queue)?;
        if backfilled > 0 {
            info!(backfilled, "Queued closed tills missing from the sync queue");
        }
        let mut stmt = conn.prepare(
            "SELECT id, CAST(entity_id AS INTEGER) FROM sync_queue
             WHERE entity_type = ?1 AND status = 'pending'
             ORDER BY CAST(entity_id AS INTEGER) DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![ENTITY_TILL, limit as i64], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut results = Vec::with_capacity(queue.len());
    for (queue_id, till_id) in queue {
        match sync_till(db, client, till_id).await {
            Ok(outcome) => results.push(PendingResult {
                caja_id: till_id,
                ok: true,
                outcome: Some(outcome),
                error: None,
            }),
            Err(e) => {
                let message = e.to_string();
                warn!(till_id, "Till sync failed: {message}");
                record_failure(db, queue_id, till_id, &message)?;
                results.push(PendingResult {
                    caja_id: till_id,
                    ok: false,
                    outcome: None,
                    error: Some(message),
                });
            }
        }
    }
    Ok(results)
}

/// Whether a till was already mirrored.
pub fn is_synced(db: &DbState, till_id: i64) -> PosResult<bool> {
    let conn = db.conn.lock()?;
    let sent: Option<i64> = conn
        .query_row(
            "SELECT COALESCE(nube_enviado, 0) FROM caja_diaria WHERE id = ?1",
            params![till_id],
            |r| r.get(0),
        )
        .optional()?;
    sent.map(|s| s != 0)
        .ok_or_else(|| PosError::not_found(format!("till {till_id}")))
}
