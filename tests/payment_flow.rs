use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use table_pos_lib::menu::{self, MenuItem};
use table_pos_lib::payments::{self, ItemSelection};
use table_pos_lib::{
    zreport, AppContext, BillFilter, BillKind, LineItem, Money, PaymentMethod, PosConfig,
    TableStatus,
};

fn cents(c: i64) -> Money {
    Money::from_cents(c)
}

fn temp_config(name: &str) -> (PosConfig, PathBuf) {
    let dir = std::env::temp_dir().join(format!("table_pos_it_{}_{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let config = PosConfig {
        data_dir: dir.clone(),
        log_dir: dir.join("logs"),
        ..PosConfig::default()
    };
    (config, dir)
}

fn seed_menu(ctx: &AppContext) {
    let item = |id: &str, name: &str, price: i64| MenuItem {
        id: id.into(),
        name: name.into(),
        price: cents(price),
        category: None,
    };
    menu::save_menu(
        &ctx.db,
        &[
            item("pizza", "Margherita Pizza", 900),
            item("water", "Sparkling Water", 250),
            item("tiramisu", "Tiramisu", 600),
        ],
    )
    .unwrap();
}

#[test]
fn split_bill_then_close_the_day() {
    let (config, dir) = temp_config("split");
    {
        let ctx = AppContext::open(config.clone()).expect("open context");
        seed_menu(&ctx);
        ctx.create_table("t4", "Table 4", 4).unwrap();
        ctx.open_table("t4", 3).unwrap();
        let table = ctx
            .order_from_menu("t4", &[("pizza", 2), ("water", 2), ("tiramisu", 1)])
            .unwrap();
        assert_eq!(table.total, cents(2900));

        let first = payments::pay_partial(&ctx, "t4", cents(1000), PaymentMethod::Card).unwrap();
        assert_eq!(first.table.total, cents(1900));
        let second = payments::pay_partial(&ctx, "t4", cents(1000), PaymentMethod::Cash).unwrap();
        assert_eq!(second.table.total, cents(900));
        assert!(!second.table_settled);

        let last = payments::pay_partial(&ctx, "t4", cents(1000), PaymentMethod::Cash).unwrap();
        assert!(last.table_settled);
        assert_eq!(last.bill.kind, BillKind::Full);
        assert_eq!(last.bill.amount, cents(900));
        assert_eq!(last.bill.change, cents(100));
    }

    // Everything survives a restart.
    let ctx = AppContext::open(config).expect("reopen context");
    let table = ctx.table("t4").unwrap();
    assert_eq!(table.status, TableStatus::Available);
    assert!(table.items.is_empty());
    assert_eq!(table.guests, 0);

    let report = zreport::commit_z_report(&ctx.db).unwrap();
    assert_eq!(report.totals.bill_count, 3);
    assert_eq!(report.totals.gross, cents(2900));
    assert_eq!(report.totals.card.amount, cents(1000));
    assert_eq!(report.totals.cash.amount, cents(1900));
    assert_eq!(report.totals.change_given, cents(100));
    assert_eq!(report.partial_count, 2);
    assert_eq!(report.full_count, 1);

    let unreported = table_pos_lib::bills::list_bills(
        &ctx.db,
        &BillFilter {
            unreported_only: true,
            ..BillFilter::default()
        },
    )
    .unwrap();
    assert!(unreported.is_empty());

    drop(ctx);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn custom_split_and_amount_payments_mix() {
    let ctx = AppContext::in_memory(PosConfig::default()).unwrap();
    ctx.create_table("t1", "Table 1", 2).unwrap();
    ctx.open_table("t1", 2).unwrap();
    ctx.add_items(
        "t1",
        vec![
            LineItem::new("steak", "Steak", cents(2400), 1),
            LineItem::new("wine", "House Wine", cents(550), 2),
        ],
    )
    .unwrap();

    // One guest pays for their own glass of wine.
    let own = payments::pay_items(
        &ctx,
        "t1",
        &[ItemSelection {
            item_id: "wine".into(),
            quantity: 1,
        }],
        PaymentMethod::Card,
        None,
    )
    .unwrap();
    assert_eq!(own.bill.amount, cents(550));
    assert_eq!(own.table.total, cents(2950));

    // The rest is split by amount.
    payments::pay_partial(&ctx, "t1", cents(1475), PaymentMethod::Card).unwrap();
    let last = payments::pay_partial(&ctx, "t1", cents(1475), PaymentMethod::Card).unwrap();
    assert!(last.table_settled);

    let summary = table_pos_lib::bills::journal_totals(&ctx.db, &BillFilter::default()).unwrap();
    assert_eq!(summary.gross, cents(3500));
}

#[test]
fn concurrent_payments_on_one_table_never_lose_money() {
    let ctx = Arc::new(AppContext::in_memory(PosConfig::default()).unwrap());
    ctx.create_table("bar", "Bar", 10).unwrap();
    ctx.open_table("bar", 8).unwrap();
    ctx.add_items("bar", vec![LineItem::new("beer", "Beer", cents(450), 8)])
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || payments::pay_partial(&ctx, "bar", cents(450), PaymentMethod::Cash))
        })
        .collect();

    let receipts: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().expect("payment"))
        .collect();

    assert_eq!(receipts.iter().filter(|r| r.table_settled).count(), 1);
    let summary = table_pos_lib::bills::journal_totals(&ctx.db, &BillFilter::default()).unwrap();
    assert_eq!(summary.bill_count, 8);
    assert_eq!(summary.gross, cents(3600));
    assert!(!ctx.table("bar").unwrap().has_open_order());
}
