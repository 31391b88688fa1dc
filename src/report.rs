//! Read-only till reports: breakdowns, KPIs and the reconciliation view.
//!
//! Closed tills report the figures stored at close time. Open tills report
//! live figures; they have no counted cash yet, so only the theoretical
//! amount is known.

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::db::DbState;
use crate::error::PosResult;
use crate::movements::{self, Movement};
use crate::till::{self, round_money, FormulaVersion, LiveTotals, ReconcileInputs, Till};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CategoryTotal {
    pub categoria: String,
    pub cantidad: i64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PaymentTotal {
    pub metodo: String,
    pub tickets: i64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProductTotal {
    pub producto_id: Option<i64>,
    pub nombre: String,
    pub cantidad: i64,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FigureSource {
    /// Persisted when the till was closed.
    Stored,
    /// Derived now from sales and movements.
    Live,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReconciliationView {
    pub version: FormulaVersion,
    pub source: FigureSource,
    pub teorico: Option<f64>,
    pub real: Option<f64>,
    pub diferencia: Option<f64>,
    /// Figures come from the pre-v2 formula and are not comparable with
    /// current ones.
    pub legacy_formula: bool,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TillKpis {
    pub ventas: i64,
    pub tickets: i64,
    pub items_vendidos: i64,
    pub ticket_promedio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TillSummary {
    pub till: Till,
    pub totals: LiveTotals,
    pub kpis: TillKpis,
    pub by_category: Vec<CategoryTotal>,
    pub by_payment: Vec<PaymentTotal>,
    pub by_product: Vec<ProductTotal>,
    pub movements: Vec<Movement>,
    pub reconciliation: ReconciliationView,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DailySales {
    pub fecha: String,
    pub total: f64,
}

const NOT_VOIDED: &str = "COALESCE(t.status, '') != 'Anulado'";

pub fn till_summary(db: &DbState, till_id: i64) -> PosResult<TillSummary> {
    let conn = db.conn.lock()?;
    till_summary_conn(&conn, till_id)
}

pub(crate) fn till_summary_conn(conn: &Connection, till_id: i64) -> PosResult<TillSummary> {
    let till = till::get_till_conn(conn, till_id)?;
    let totals = till::live_totals(conn, till_id)?;
    let reconciliation = reconciliation_view(&till, &totals);

    Ok(TillSummary {
        kpis: kpis(conn, till_id)?,
        by_category: by_category(conn, till_id)?,
        by_payment: by_payment(conn, till_id)?,
        by_product: by_product(conn, till_id)?,
        movements: movements::list_movements_conn(conn, till_id)?,
        till,
        totals,
        reconciliation,
    })
}

fn reconciliation_view(till: &Till, totals: &LiveTotals) -> ReconciliationView {
    if till.is_open() {
        let version = FormulaVersion::CURRENT;
        let live = till::reconcile(
            &ReconcileInputs {
                fondo_inicial: till.fondo_inicial,
                total_ventas: totals.total_ventas,
                ventas_efectivo: totals.ventas_efectivo,
                ingresos: totals.ingresos,
                retiros: totals.retiros,
                conteo_efectivo: 0.0,
                transferencias: totals.ventas_transferencia,
            },
            version,
        );
        return ReconciliationView {
            version,
            source: FigureSource::Live,
            teorico: Some(live.teorico),
            real: None,
            diferencia: None,
            legacy_formula: false,
        };
    }

    let version = till.calculation_version;
    let legacy_formula = version == FormulaVersion::V1;

    let real = match version {
        FormulaVersion::V2 => till
            .conteo_efectivo_final
            .map(|c| round_money(c + till.transferencias_final.unwrap_or(0.0))),
        FormulaVersion::V1 => match (till.total_efectivo_teorico, till.diferencia) {
            (Some(t), Some(d)) => Some(round_money(t + d)),
            _ => None,
        },
    };
    ReconciliationView {
        version,
        source: FigureSource::Stored,
        teorico: till.total_efectivo_teorico,
        real,
        diferencia: till.diferencia,
        legacy_formula,
    }
}

fn kpis(conn: &Connection, till_id: i64) -> PosResult<TillKpis> {
    let (ventas, tickets, total): (i64, i64, f64) = conn.query_row(
        &format!(
            "SELECT COUNT(DISTINCT v.id), COUNT(t.id), COALESCE(SUM(t.total_ticket), 0)
             FROM tickets t JOIN ventas v ON v.id = t.venta_id
             WHERE v.caja_id = ?1 AND {NOT_VOIDED}"
        ),
        params![till_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;
    let items: i64 = conn.query_row(
        &format!(
            "SELECT COALESCE(SUM(vi.cantidad), 0)
             FROM venta_items vi
             JOIN tickets t ON t.id = vi.ticket_id
             JOIN ventas v ON v.id = t.venta_id
             WHERE v.caja_id = ?1 AND {NOT_VOIDED}"
        ),
        params![till_id],
        |r| r.get(0),
    )?;
    Ok(TillKpis {
        ventas,
        tickets,
        items_vendidos: items,
        ticket_promedio: if ventas > 0 {
            round_money(total / ventas as f64)
        } else {
            0.0
        },
    })
}

fn by_category(conn: &Connection, till_id: i64) -> PosResult<Vec<CategoryTotal>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT COALESCE(c.descripcion, '(sin categoria)'), COUNT(t.id), COALESCE(SUM(t.total_ticket), 0)
         FROM tickets t
         JOIN ventas v ON v.id = t.venta_id
         LEFT JOIN Categoria_Producto c ON c.id = t.categoria_id
         WHERE v.caja_id = ?1 AND {NOT_VOIDED}
         GROUP BY 1
         ORDER BY 3 DESC, 1"
    ))?;
    let rows = stmt
        .query_map(params![till_id], |r| {
            Ok(CategoryTotal {
                categoria: r.get(0)?,
                cantidad: r.get(1)?,
                total: round_money(r.get(2)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn by_payment(conn: &Connection, till_id: i64) -> PosResult<Vec<PaymentTotal>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT COALESCE(mp.descripcion, '(sin metodo)'), COUNT(t.id), COALESCE(SUM(t.total_ticket), 0)
         FROM tickets t
         JOIN ventas v ON v.id = t.venta_id
         LEFT JOIN metodos_pago mp ON mp.id = v.metodo_pago_id
         WHERE v.caja_id = ?1 AND {NOT_VOIDED}
         GROUP BY 1
         ORDER BY 3 DESC, 1"
    ))?;
    let rows = stmt
        .query_map(params![till_id], |r| {
            Ok(PaymentTotal {
                metodo: r.get(0)?,
                tickets: r.get(1)?,
                total: round_money(r.get(2)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn by_product(conn: &Connection, till_id: i64) -> PosResult<Vec<ProductTotal>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT vi.producto_id, COALESCE(p.nombre, '(sin nombre)'),
                COALESCE(SUM(vi.cantidad), 0), COALESCE(SUM(vi.subtotal), 0)
         FROM venta_items vi
         JOIN tickets t ON t.id = vi.ticket_id
         JOIN ventas v ON v.id = t.venta_id
         LEFT JOIN products p ON p.id = vi.producto_id
         WHERE v.caja_id = ?1 AND {NOT_VOIDED}
         GROUP BY vi.producto_id
         ORDER BY 3 DESC, 2"
    ))?;
    let rows = stmt
        .query_map(params![till_id], |r| {
            Ok(ProductTotal {
                producto_id: r.get(0)?,
                nombre: r.get(1)?,
                cantidad: r.get(2)?,
                total: round_money(r.get(3)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Non-voided sales per till date, optionally for one discipline.
pub fn sales_by_day(db: &DbState, disciplina: Option<&str>) -> PosResult<Vec<DailySales>> {
    let conn = db.conn.lock()?;
    let disciplina = disciplina.map(|d| d.trim().to_uppercase()).filter(|d| !d.is_empty());
    let mut stmt = conn.prepare(&format!(
        "SELECT cd.fecha, COALESCE(SUM(t.total_ticket), 0)
         FROM caja_diaria cd
         JOIN ventas v ON v.caja_id = cd.id
         JOIN tickets t ON t.venta_id = v.id
         WHERE {NOT_VOIDED} AND (?1 IS NULL OR cd.disciplina = ?1)
         GROUP BY cd.fecha
         ORDER BY cd.fecha"
    ))?;
    let rows = stmt
        .query_map(params![disciplina], |r| {
            Ok(DailySales {
                fecha: r.get(0)?,
                total: round_money(r.get(1)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::insert_product;
    use crate::catalog::PaymentMethodRef;
    use crate::db::test_db;
    use crate::movements::MovementKind;
    use crate::sales::{self, CartLine, CheckoutRequest};
    use crate::till::tests::{close_req, open_req, POS};

    fn sell(db: &DbState, product_id: i64, quantity: i64, method: &str) -> sales::Sale {
        sales::checkout(
            db,
            POS,
            &CheckoutRequest {
                lines: vec![CartLine {
                    product_id,
                    quantity,
                    unit_price: None,
                }],
                payment: PaymentMethodRef::from(method),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_summary_breakdowns_exclude_voided() {
        let db = test_db();
        let till = till::open_till(&db, POS, &open_req(1000.0)).unwrap();
        let chori = insert_product(&db, "CHORI", "Choripan", 1500.0, 10, true);
        let coca = insert_product(&db, "COCA", "Coca", 900.0, 10, true);
        let sale = sell(&db, chori, 2, "Efectivo");
        sell(&db, coca, 1, "Transferencia");
        sales::void_ticket(&db, sale.tickets[0].id).unwrap();
        movements::record_movement(&db, till.id, MovementKind::Retiro, 200.0, None).unwrap();

        let s = till_summary(&db, till.id).unwrap();
        assert_eq!(s.totals.total_ventas, 2400.0);
        assert_eq!(s.totals.tickets_anulados, 1);
        assert_eq!(s.kpis.ventas, 2);
        assert_eq!(s.kpis.tickets, 2);
        assert_eq!(s.kpis.items_vendidos, 2);
        assert_eq!(s.kpis.ticket_promedio, 1200.0);

        assert_eq!(s.by_product.len(), 2);
        assert_eq!(s.by_product.iter().map(|p| p.total).sum::<f64>(), 2400.0);
        let cash = s.by_payment.iter().find(|p| p.metodo == "Efectivo").unwrap();
        assert_eq!(cash.total, 1500.0);
        assert_eq!(s.by_category.len(), 1);
        assert_eq!(s.movements.len(), 1);

        assert_eq!(s.reconciliation.source, FigureSource::Live);
        assert_eq!(s.reconciliation.teorico, Some(3200.0));
        assert!(s.reconciliation.diferencia.is_none());
        assert!(!s.reconciliation.legacy_formula);
    }

    #[test]
    fn test_closed_summary_uses_stored_figures() {
        let db = test_db();
        let till = till::open_till(&db, POS, &open_req(500.0)).unwrap();
        let p = insert_product(&db, "AGUA", "Agua", 500.0, 10, true);
        sell(&db, p, 2, "Efectivo");
        till::close_till(&db, till.id, &close_req(1400.0, None), None).unwrap();

        let s = till_summary(&db, till.id).unwrap();
        assert_eq!(s.reconciliation.source, FigureSource::Stored);
        assert_eq!(s.reconciliation.teorico, Some(1500.0));
        assert_eq!(s.reconciliation.real, Some(1400.0));
        assert_eq!(s.reconciliation.diferencia, Some(-100.0));
    }

    #[test]
    fn test_legacy_till_is_flagged_not_recomputed() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO caja_diaria (fecha, hora_apertura, fondo_inicial, estado,
                    total_ventas, total_efectivo_teorico, conteo_efectivo_final,
                    transferencias_final, diferencia, calculation_version)
                 VALUES ('2024-10-01', '09:00:00', 1000, 'cerrada', 5000, 5700, 3700, 2000, 700, 1)",
                [],
            )
            .unwrap();
        }
        let id = db.conn.lock().unwrap().last_insert_rowid();
        let s = till_summary(&db, id).unwrap();
        assert!(s.reconciliation.legacy_formula);
        assert_eq!(s.reconciliation.version, FormulaVersion::V1);
        assert_eq!(s.reconciliation.diferencia, Some(700.0));
        assert_eq!(s.reconciliation.real, Some(6400.0));
    }

    #[test]
    fn test_sales_by_day_filters_discipline() {
        let db = test_db();
        till::open_till(&db, POS, &open_req(0.0)).unwrap();
        let p = insert_product(&db, "AGUA", "Agua", 500.0, 10, true);
        sell(&db, p, 3, "Efectivo");
        let all = sales_by_day(&db, None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].total, 1500.0);
        assert_eq!(sales_by_day(&db, Some("bar")).unwrap().len(), 1);
        assert!(sales_by_day(&db, Some("VOL")).unwrap().is_empty());
    }
}
