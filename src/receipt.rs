//! Receipt layouts: the per-unit sale ticket and the till close report.
//!
//! A [`Receipt`] is a list of layout lines that renders either to plain text
//! (file fallback, previews) or to ESC/POS bytes for a thermal printer.

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::escpos::{EscPosBuilder, PaperWidth};
use crate::report::TillSummary;
use crate::sales::Ticket;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ReceiptLine {
    /// Large bold centred heading.
    Title(String),
    Centered(String),
    Text(String),
    Pair(String, String),
    Separator,
    Blank,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Receipt {
    pub lines: Vec<ReceiptLine>,
}

impl Receipt {
    fn push(&mut self, line: ReceiptLine) -> &mut Self {
        self.lines.push(line);
        self
    }

    fn pair(&mut self, label: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.push(ReceiptLine::Pair(label.into(), value.into()))
    }

    pub fn to_text(&self, paper: PaperWidth) -> String {
        let width = paper.chars();
        let mut out = String::new();
        for line in &self.lines {
            match line {
                ReceiptLine::Title(s) | ReceiptLine::Centered(s) => {
                    let pad = width.saturating_sub(s.chars().count()) / 2;
                    out.push_str(&" ".repeat(pad));
                    out.push_str(s);
                }
                ReceiptLine::Text(s) => out.push_str(s),
                ReceiptLine::Pair(label, value) => {
                    let used = label.chars().count() + value.chars().count();
                    let gap = width.saturating_sub(used).max(1);
                    out.push_str(label);
                    out.push_str(&" ".repeat(gap));
                    out.push_str(value);
                }
                ReceiptLine::Separator => out.push_str(&"-".repeat(width)),
                ReceiptLine::Blank => {}
            }
            out.push('\n');
        }
        out
    }

    pub fn to_escpos(&self, paper: PaperWidth) -> Vec<u8> {
        let mut b = EscPosBuilder::new().with_paper(paper);
        b.init().spanish();
        for line in &self.lines {
            match line {
                ReceiptLine::Title(s) => {
                    b.center()
                        .bold(true)
                        .text_size(2, 2)
                        .text(s)
                        .lf()
                        .normal_size()
                        .bold(false)
                        .left();
                }
                ReceiptLine::Centered(s) => {
                    b.center().text(s).lf().left();
                }
                ReceiptLine::Text(s) => {
                    b.text(s).lf();
                }
                ReceiptLine::Pair(label, value) => {
                    b.line_pair(label, value);
                }
                ReceiptLine::Separator => {
                    b.separator();
                }
                ReceiptLine::Blank => {
                    b.lf();
                }
            }
        }
        b.feed(3).cut();
        b.build()
    }
}

/// Format an amount as Argentine pesos: `$ 1.234,50`.
pub fn money(amount: f64) -> String {
    let cents = (amount.abs() * 100.0).round() as u64;
    let whole = (cents / 100).to_string();
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    let sign = if amount < 0.0 && cents > 0 { "-" } else { "" };
    format!("{sign}$ {grouped},{:02}", cents % 100)
}

/// Like [`money`] but always shows the sign of a non-zero amount.
pub fn signed_money(amount: f64) -> String {
    if (amount * 100.0).round() > 0.0 {
        format!("+{}", money(amount))
    } else {
        money(amount)
    }
}

fn display_datetime(raw: &str) -> String {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.format("%d/%m/%Y %H:%M").to_string())
        .unwrap_or_else(|_| raw.to_string())
}

/// One physical ticket per sold unit.
pub fn sale_ticket(ticket: &Ticket, till_code: &str) -> Receipt {
    let mut r = Receipt::default();
    r.push(ReceiptLine::Title("BUFFET".into()));
    if let Some(id) = &ticket.identificador {
        r.push(ReceiptLine::Centered(format!("Nº {id}")));
    }
    r.push(ReceiptLine::Centered(display_datetime(&ticket.fecha_hora)))
        .push(ReceiptLine::Centered(format!("Caja {till_code}")))
        .push(ReceiptLine::Separator)
        .push(ReceiptLine::Title(
            ticket
                .producto
                .as_deref()
                .unwrap_or("PRODUCTO")
                .to_uppercase(),
        ))
        .push(ReceiptLine::Centered(money(ticket.total)))
        .push(ReceiptLine::Separator);
    r
}

/// Close report for a till, built from its summary.
pub fn close_report(summary: &TillSummary) -> Receipt {
    let till = &summary.till;
    let totals = &summary.totals;
    let mut r = Receipt::default();

    r.push(ReceiptLine::Title("CIERRE DE CAJA".into()))
        .push(ReceiptLine::Centered(till.label()))
        .push(ReceiptLine::Separator)
        .pair("Fecha", till.fecha.clone())
        .pair("Apertura", till.hora_apertura.clone())
        .pair("Cierre", till.hora_cierre.clone().unwrap_or_else(|| "-".into()))
        .pair("Usuario apertura", till.usuario_apertura.clone().unwrap_or_default())
        .pair("Usuario cierre", till.usuario_cierre.clone().unwrap_or_default());
    if let Some(cajero) = &till.cajero_apertura {
        r.pair("Cajero", cajero.clone());
    }
    if let Some(disciplina) = &till.disciplina {
        r.pair("Disciplina", disciplina.clone());
    }
    if let Some(evento) = &till.descripcion_evento {
        r.pair("Evento", evento.clone());
    }

    r.push(ReceiptLine::Separator)
        .push(ReceiptLine::Text("VENTAS POR MEDIO DE PAGO".into()));
    for p in &summary.by_payment {
        r.pair(format!("{} ({})", p.metodo, p.tickets), money(p.total));
    }
    r.pair("Total ventas", money(totals.total_ventas));

    let transferencias = till
        .transferencias_final
        .unwrap_or(totals.ventas_transferencia);
    r.push(ReceiptLine::Separator)
        .pair("Fondo inicial", money(till.fondo_inicial))
        .pair(
            "Conteo efectivo",
            money(till.conteo_efectivo_final.unwrap_or(0.0)),
        )
        .pair("Transferencias", money(transferencias))
        .pair("Ingresos", money(totals.ingresos))
        .pair("Retiros", money(-totals.retiros));
    if let Some(teorico) = summary.reconciliation.teorico {
        r.pair("Efectivo teórico", money(teorico));
    }
    match summary.reconciliation.diferencia {
        Some(d) => r.pair("Diferencia", signed_money(d)),
        None => r.pair("Diferencia", "-"),
    };
    if summary.reconciliation.legacy_formula {
        r.push(ReceiptLine::Text("* Calculado con fórmula v1".into()));
    }
    r.pair("Tickets anulados", totals.tickets_anulados.to_string());

    if !summary.by_product.is_empty() {
        r.push(ReceiptLine::Separator)
            .push(ReceiptLine::Text("ITEMS VENDIDOS".into()));
        for item in &summary.by_product {
            r.push(ReceiptLine::Text(format!(
                "({} x {}) = {}",
                item.nombre,
                item.cantidad,
                money(item.total)
            )));
        }
    }

    if let Some(obs) = till.obs_cierre.as_deref().filter(|s| !s.is_empty()) {
        r.push(ReceiptLine::Separator)
            .push(ReceiptLine::Text(format!("Obs: {obs}")));
    }
    r.push(ReceiptLine::Separator);
    r
}
