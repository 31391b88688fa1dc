//! Command-line front end. Every command prints its result as JSON on stdout.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use crate::catalog::{self, NewProduct, PaymentMethodRef, ProductUpdate};
use crate::cloud_sync::{self, CloudClient};
use crate::config;
use crate::movements::{self, MovementKind};
use crate::print;
use crate::report;
use crate::sales::{self, CartLine, CheckoutRequest};
use crate::storage;
use crate::terminal;
use crate::till::{self, CloseTillRequest, OpenTillRequest};
use crate::users::{self, Role};
use crate::{backup, bootstrap, logging, AppContext};

#[derive(Parser)]
#[command(name = "buffet-pos", version, about = "BuffetApp POS till engine")]
pub struct Cli {
    /// Data directory (defaults to BUFFET_POS_DATA_DIR or the per-user app dir)
    #[arg(long, value_name = "PATH", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Open, inspect and close tills
    #[command(subcommand)]
    Till(TillCmd),
    /// Manual cash ingresos / retiros
    #[command(subcommand)]
    Movement(MovementCmd),
    /// Sell from the catalog
    #[command(subcommand)]
    Sale(SaleCmd),
    /// List, void and reprint tickets
    #[command(subcommand)]
    Ticket(TicketCmd),
    /// Catalog and stock
    #[command(subcommand)]
    Product(ProductCmd),
    /// Till summaries and daily totals
    #[command(subcommand)]
    Report(ReportCmd),
    /// Mirror closed tills to the cloud
    #[command(subcommand)]
    Sync(SyncCmd),
    /// Copy the database into the backup folder
    Backup {
        /// Only list existing backups
        #[arg(long)]
        list: bool,
    },
    /// Per-device settings
    #[command(subcommand)]
    Config(ConfigCmd),
    /// Local accounts
    #[command(subcommand)]
    User(UserCmd),
}

#[derive(Subcommand)]
enum TillCmd {
    /// Open a till on this POS
    Open {
        #[arg(long)]
        user: String,
        #[arg(long)]
        cashier: String,
        #[arg(long)]
        fondo: f64,
        #[arg(long)]
        disciplina: Option<String>,
        #[arg(long)]
        template: Option<i64>,
        #[arg(long)]
        evento: Option<String>,
        #[arg(long)]
        obs: Option<String>,
    },
    /// The open till of this POS, if any
    Current,
    /// Full summary of a till
    Show { id: i64 },
    /// Tills of a date (YYYY-MM-DD) or the latest ones
    List {
        #[arg(long)]
        fecha: Option<String>,
    },
    /// Live difference for a count, without closing
    Preview {
        id: i64,
        #[command(flatten)]
        count: CountArgs,
    },
    /// Close a till and back up the database
    Close {
        id: i64,
        #[command(flatten)]
        count: CountArgs,
        #[arg(long)]
        user: String,
        #[arg(long)]
        obs: Option<String>,
        /// Print the close report afterwards
        #[arg(long)]
        print: bool,
    },
    /// Till templates (code prefixes)
    Templates,
    /// Add a till template
    TemplateAdd {
        descripcion: String,
        #[arg(long)]
        prefijo: String,
        /// Make it the default template
        #[arg(long)]
        default: bool,
    },
}

#[derive(Args)]
struct CountArgs {
    /// Counted cash
    #[arg(long)]
    conteo: f64,
    /// Transfers total; defaults to the till's non-cash sales
    #[arg(long)]
    transferencias: Option<f64>,
}

#[derive(Subcommand)]
enum MovementCmd {
    Add {
        till: i64,
        #[command(flatten)]
        entry: MovementArgs,
    },
    Edit {
        id: i64,
        #[command(flatten)]
        entry: MovementArgs,
    },
    Delete {
        id: i64,
    },
    List {
        till: i64,
    },
}

#[derive(Args)]
struct MovementArgs {
    /// INGRESO or RETIRO
    #[arg(long)]
    tipo: String,
    #[arg(long)]
    monto: f64,
    #[arg(long)]
    obs: Option<String>,
}

#[derive(Subcommand)]
enum SaleCmd {
    /// Sell on the open till of this POS
    Checkout {
        /// PRODUCT_ID:QTY[:PRICE], repeatable
        #[arg(long = "line", value_name = "LINE", required = true, value_parser = parse_cart_line)]
        lines: Vec<CartLine>,
        /// Payment method id or description
        #[arg(long, default_value = "Efectivo")]
        payment: String,
        /// Print the tickets right away
        #[arg(long)]
        print: bool,
    },
}

#[derive(Subcommand)]
enum TicketCmd {
    List { till: i64 },
    Void { id: i64 },
    Reprint {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
}

#[derive(Subcommand)]
enum ProductCmd {
    List {
        /// Include hidden products
        #[arg(long)]
        all: bool,
    },
    Add {
        #[arg(long)]
        codigo: String,
        #[arg(long)]
        nombre: String,
        #[arg(long)]
        precio: f64,
        #[arg(long, default_value_t = 0.0)]
        costo: f64,
        #[arg(long, default_value_t = 0)]
        stock: i64,
        #[arg(long, default_value_t = 3)]
        minimo: i64,
        #[arg(long)]
        categoria: Option<i64>,
        /// Do not track stock for this product
        #[arg(long)]
        untracked: bool,
    },
    /// Manual stock adjustment
    Stock {
        id: i64,
        #[arg(long, allow_hyphen_values = true)]
        delta: i64,
        #[arg(long, default_value = "ajuste")]
        motivo: String,
    },
    /// Change name, prices, minimum or category
    Edit {
        id: i64,
        #[arg(long)]
        nombre: Option<String>,
        #[arg(long)]
        precio: Option<f64>,
        #[arg(long)]
        costo: Option<f64>,
        #[arg(long)]
        minimo: Option<i64>,
        #[arg(long)]
        categoria: Option<i64>,
    },
    Hide { id: i64 },
    Unhide { id: i64 },
    /// Tracked products at or below their minimum stock
    LowStock,
    Categories,
    CategoryAdd { descripcion: String },
    Payments,
    Disciplines,
}

#[derive(Subcommand)]
enum ReportCmd {
    /// Summary of one till
    Till {
        id: i64,
        /// Print the close report
        #[arg(long)]
        print: bool,
    },
    /// Sales per day
    Daily {
        #[arg(long)]
        disciplina: Option<String>,
    },
}

#[derive(Subcommand)]
enum SyncCmd {
    /// Upload queued closed tills
    Pending {
        #[arg(long, default_value_t = cloud_sync::DEFAULT_PENDING_LIMIT)]
        limit: usize,
    },
    /// Upload one closed till
    Till { id: i64 },
    /// Show the sync queue
    Queue,
}

#[derive(Subcommand)]
enum ConfigCmd {
    Show,
    Set { key: String, value: String },
    /// Store the Supabase anon key in the OS keyring
    SetKey { value: String },
    /// Remove the stored anon key
    ClearKey,
}

#[derive(Subcommand)]
enum UserCmd {
    Add {
        usuario: String,
        #[arg(long)]
        password: String,
        #[arg(long, default_value = "cajero")]
        rol: String,
    },
    Login {
        usuario: String,
        #[arg(long)]
        password: String,
    },
    List,
}

fn parse_cart_line(raw: &str) -> Result<CartLine, String> {
    let parts: Vec<&str> = raw.split(':').collect();
    let (id, qty, price) = match parts.as_slice() {
        [id, qty] => (id, qty, None),
        [id, qty, price] => (id, qty, Some(price)),
        _ => return Err(format!("expected PRODUCT_ID:QTY[:PRICE], got '{raw}'")),
    };
    Ok(CartLine {
        product_id: id
            .trim()
            .parse()
            .map_err(|_| format!("bad product id in '{raw}'"))?,
        quantity: qty
            .trim()
            .parse()
            .map_err(|_| format!("bad quantity in '{raw}'"))?,
        unit_price: price
            .map(|p| p.trim().parse::<f64>())
            .transpose()
            .map_err(|_| format!("bad price in '{raw}'"))?,
    })
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse the command line, start the app and run the command.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(config::data_dir);
    logging::init(&config::log_dir(&data_dir));

    let ctx = bootstrap(data_dir.clone())
        .with_context(|| format!("starting BuffetApp in {}", data_dir.display()))?;

    match cli.cmd {
        Cmd::Till(cmd) => till_cmd(&ctx, cmd),
        Cmd::Movement(cmd) => movement_cmd(&ctx, cmd),
        Cmd::Sale(cmd) => sale_cmd(&ctx, cmd),
        Cmd::Ticket(cmd) => ticket_cmd(&ctx, cmd),
        Cmd::Product(cmd) => product_cmd(&ctx, cmd),
        Cmd::Report(cmd) => report_cmd(&ctx, cmd),
        Cmd::Sync(cmd) => sync_cmd(&ctx, cmd),
        Cmd::Backup { list } => {
            let dir = ctx.backup_dir();
            if list {
                emit(&backup::list_backups(&dir)?)
            } else {
                emit(&backup::backup_database(&ctx.db, &dir)?)
            }
        }
        Cmd::Config(cmd) => config_cmd(ctx, cmd),
        Cmd::User(cmd) => user_cmd(&ctx, cmd),
    }
}

fn till_cmd(ctx: &AppContext, cmd: TillCmd) -> Result<()> {
    let db = &ctx.db;
    match cmd {
        TillCmd::Open {
            user,
            cashier,
            fondo,
            disciplina,
            template,
            evento,
            obs,
        } => {
            let req = OpenTillRequest {
                usuario: user,
                cajero: cashier,
                fondo_inicial: fondo,
                disciplina,
                template_id: template,
                descripcion_evento: evento,
                observaciones: obs,
            };
            emit(&till::open_till(db, &ctx.pos.pos_uuid, &req)?)
        }
        TillCmd::Current => emit(&till::current_till(db, &ctx.pos.pos_uuid)?),
        TillCmd::Show { id } => emit(&report::till_summary(db, id)?),
        TillCmd::List { fecha } => emit(&till::list_tills(db, fecha.as_deref())?),
        TillCmd::Preview { id, count } => emit(&till::preview_close(
            db,
            id,
            count.conteo,
            count.transferencias,
        )?),
        TillCmd::Close {
            id,
            count,
            user,
            obs,
            print,
        } => {
            let req = CloseTillRequest {
                conteo_efectivo: count.conteo,
                transferencias: count.transferencias,
                usuario_cierre: user,
                observaciones: obs,
            };
            let outcome = till::close_till(db, id, &req, Some(&ctx.backup_dir()))?;
            if print {
                let printed = print::print_close_report(db, &ctx.print_settings(), id)?;
                return emit(&serde_json::json!({ "close": outcome, "print": printed }));
            }
            emit(&outcome)
        }
        TillCmd::Templates => emit(&terminal::list_templates(db)?),
        TillCmd::TemplateAdd {
            descripcion,
            prefijo,
            default,
        } => emit(&terminal::create_template(db, &descripcion, &prefijo, default)?),
    }
}

fn movement_cmd(ctx: &AppContext, cmd: MovementCmd) -> Result<()> {
    let db = &ctx.db;
    match cmd {
        MovementCmd::Add { till, entry } => emit(&movements::record_movement(
            db,
            till,
            MovementKind::parse(&entry.tipo)?,
            entry.monto,
            entry.obs.as_deref(),
        )?),
        MovementCmd::Edit { id, entry } => emit(&movements::update_movement(
            db,
            id,
            MovementKind::parse(&entry.tipo)?,
            entry.monto,
            entry.obs.as_deref(),
        )?),
        MovementCmd::Delete { id } => {
            movements::delete_movement(db, id)?;
            emit(&serde_json::json!({ "deleted": id }))
        }
        MovementCmd::List { till } => emit(&movements::list_movements(db, till)?),
    }
}

fn sale_cmd(ctx: &AppContext, cmd: SaleCmd) -> Result<()> {
    let SaleCmd::Checkout {
        lines,
        payment,
        print,
    } = cmd;
    let req = CheckoutRequest {
        lines,
        payment: PaymentMethodRef::from(payment.as_str()),
    };
    let sale = sales::checkout(&ctx.db, &ctx.pos.pos_uuid, &req)?;
    if print {
        let ids: Vec<i64> = sale.tickets.iter().map(|t| t.id).collect();
        let printed = print::print_tickets(&ctx.db, &ctx.print_settings(), &ids)?;
        return emit(&serde_json::json!({ "sale": sale, "print": printed }));
    }
    emit(&sale)
}

fn ticket_cmd(ctx: &AppContext, cmd: TicketCmd) -> Result<()> {
    let db = &ctx.db;
    match cmd {
        TicketCmd::List { till } => emit(&sales::list_tickets(db, till)?),
        TicketCmd::Void { id } => emit(&sales::void_ticket(db, id)?),
        TicketCmd::Reprint { ids } => {
            emit(&print::print_tickets(db, &ctx.print_settings(), &ids)?)
        }
    }
}

fn product_cmd(ctx: &AppContext, cmd: ProductCmd) -> Result<()> {
    let db = &ctx.db;
    match cmd {
        ProductCmd::List { all } => emit(&catalog::list_products(db, all)?),
        ProductCmd::Add {
            codigo,
            nombre,
            precio,
            costo,
            stock,
            minimo,
            categoria,
            untracked,
        } => {
            let new = NewProduct {
                codigo_producto: codigo,
                nombre,
                precio_compra: costo,
                precio_venta: precio,
                stock_actual: stock,
                stock_minimo: minimo,
                categoria_id: categoria,
                color: None,
                contabiliza_stock: !untracked,
            };
            emit(&catalog::create_product(db, &new)?)
        }
        ProductCmd::Stock { id, delta, motivo } => {
            emit(&catalog::adjust_stock(db, id, delta, &motivo)?)
        }
        ProductCmd::Edit {
            id,
            nombre,
            precio,
            costo,
            minimo,
            categoria,
        } => {
            let update = ProductUpdate {
                nombre,
                precio_compra: costo,
                precio_venta: precio,
                stock_minimo: minimo,
                categoria_id: categoria,
                ..ProductUpdate::default()
            };
            emit(&catalog::update_product(db, id, &update)?)
        }
        ProductCmd::Hide { id } => {
            catalog::set_visibility(db, id, false)?;
            emit(&catalog::get_product(db, id)?)
        }
        ProductCmd::Unhide { id } => {
            catalog::set_visibility(db, id, true)?;
            emit(&catalog::get_product(db, id)?)
        }
        ProductCmd::LowStock => {
            let low: Vec<_> = catalog::list_products(db, true)?
                .into_iter()
                .filter(|p| p.below_minimum())
                .collect();
            emit(&low)
        }
        ProductCmd::Categories => emit(&catalog::list_categories(db)?),
        ProductCmd::CategoryAdd { descripcion } => {
            emit(&catalog::create_category(db, &descripcion)?)
        }
        ProductCmd::Payments => emit(&catalog::list_payment_methods(db)?),
        ProductCmd::Disciplines => emit(&catalog::list_disciplines(db)?),
    }
}

fn report_cmd(ctx: &AppContext, cmd: ReportCmd) -> Result<()> {
    match cmd {
        ReportCmd::Till { id, print } => {
            if print {
                emit(&print::print_close_report(&ctx.db, &ctx.print_settings(), id)?)
            } else {
                emit(&report::till_summary(&ctx.db, id)?)
            }
        }
        ReportCmd::Daily { disciplina } => {
            emit(&report::sales_by_day(&ctx.db, disciplina.as_deref())?)
        }
    }
}

fn sync_cmd(ctx: &AppContext, cmd: SyncCmd) -> Result<()> {
    match cmd {
        SyncCmd::Queue => emit(&cloud_sync::pending_queue(&ctx.db)?),
        SyncCmd::Pending { limit } => {
            let (client, runtime) = remote(ctx)?;
            let results = runtime.block_on(cloud_sync::sync_pending(&ctx.db, &client, limit))?;
            emit(&results)
        }
        SyncCmd::Till { id } => {
            if cloud_sync::is_synced(&ctx.db, id)? {
                tracing::info!(till_id = id, "Till already mirrored, sending again");
            }
            let (client, runtime) = remote(ctx)?;
            let outcome = runtime.block_on(cloud_sync::sync_till(&ctx.db, &client, id))?;
            emit(&outcome)
        }
    }
}

fn remote(ctx: &AppContext) -> Result<(CloudClient, tokio::runtime::Runtime)> {
    let client = CloudClient::from_credentials(storage::cloud_credentials(&ctx.config))?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;
    Ok((client, runtime))
}

fn config_cmd(ctx: AppContext, cmd: ConfigCmd) -> Result<()> {
    let AppContext {
        data_dir,
        config: mut cfg,
        ..
    } = ctx;
    match cmd {
        ConfigCmd::Show => emit(&cfg),
        ConfigCmd::Set { key, value } => {
            cfg.set(&key, &value)?;
            cfg.save(&config::config_path(&data_dir))?;
            emit(&cfg)
        }
        ConfigCmd::SetKey { value } => {
            if value.trim().is_empty() {
                bail!("key cannot be empty");
            }
            storage::set_credential(storage::KEY_SUPABASE_ANON_KEY, value.trim())?;
            emit(&serde_json::json!({ "stored": storage::KEY_SUPABASE_ANON_KEY }))
        }
        ConfigCmd::ClearKey => {
            storage::delete_credential(storage::KEY_SUPABASE_ANON_KEY)?;
            emit(&serde_json::json!({ "cleared": storage::KEY_SUPABASE_ANON_KEY }))
        }
    }
}

fn user_cmd(ctx: &AppContext, cmd: UserCmd) -> Result<()> {
    let db = &ctx.db;
    match cmd {
        UserCmd::Add {
            usuario,
            password,
            rol,
        } => emit(&users::create_user(db, &usuario, &password, Role::parse(&rol)?)?),
        UserCmd::Login { usuario, password } => {
            emit(&users::authenticate(db, &usuario, &password)?)
        }
        UserCmd::List => emit(&users::list_users(db)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_cart_line() {
        let line = parse_cart_line("12:3").unwrap();
        assert_eq!((line.product_id, line.quantity, line.unit_price), (12, 3, None));
        let line = parse_cart_line("4:1:950.5").unwrap();
        assert_eq!(line.unit_price, Some(950.5));
        assert!(parse_cart_line("4").is_err());
        assert!(parse_cart_line("x:1").is_err());
        assert!(parse_cart_line("4:1:abc").is_err());
    }

    #[test]
    fn test_parse_close_command() {
        let cli = Cli::try_parse_from([
            "buffet-pos",
            "--data-dir",
            "/tmp/pos",
            "till",
            "close",
            "7",
            "--conteo",
            "15000",
            "--user",
            "admin",
        ])
        .unwrap();
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/pos")));
        match cli.cmd {
            Cmd::Till(TillCmd::Close { id, count, print, .. }) => {
                assert_eq!(id, 7);
                assert_eq!(count.conteo, 15000.0);
                assert_eq!(count.transferencias, None);
                assert!(!print);
            }
            _ => panic!("expected till close"),
        }
    }

    #[test]
    fn test_parse_negative_stock_delta() {
        let cli =
            Cli::try_parse_from(["buffet-pos", "product", "stock", "3", "--delta", "-5"]).unwrap();
        assert!(matches!(
            cli.cmd,
            Cmd::Product(ProductCmd::Stock { id: 3, delta: -5, .. })
        ));
    }
}
