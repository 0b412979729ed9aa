//! Inventory demo application.
//!
//! Clients (sources) order and restock items in one shared warehouse. An
//! order the warehouse cannot fill is rolled back. A reorder output watches
//! stock levels and loops a restock command back into the engine when an
//! item runs low.
//!
//! Commands are UTF-8 `<item>:<quantity>` with payload type [`ORDER`] or
//! [`RESTOCK`]. Every accepted command routes one [`STOCK`] event carrying the
//! item's new level as `<item>:<level>`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use lockstep::{
    Ack, Capability, CommandProcessor, CommandRecord, EventApplier, EventRecord, EventRouter,
    Output, OutputContext, PayloadType, SourceId,
};
use tracing::{debug, info};

pub const ORDER: PayloadType = 1;
pub const RESTOCK: PayloadType = 2;
pub const STOCK: PayloadType = 10;

pub const ITEMS: [&str; 3] = ["bolt", "gear", "spring"];

fn parse_line(text: &str) -> Result<(&str, i64)> {
    let (item, quantity) = text
        .split_once(':')
        .with_context(|| format!("expected '<item>:<quantity>', got '{text}'"))?;
    let quantity = quantity
        .parse()
        .with_context(|| format!("invalid quantity '{quantity}'"))?;
    Ok((item, quantity))
}

/// Shared stock levels, written by the applier only.
#[derive(Clone, Default)]
pub struct Warehouse {
    stock: Rc<RefCell<BTreeMap<String, i64>>>,
}

impl Warehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self, item: &str) -> i64 {
        self.stock.borrow().get(item).copied().unwrap_or(0)
    }

    pub fn stock(&self) -> BTreeMap<String, i64> {
        self.stock.borrow().clone()
    }

    pub fn processor(&self) -> InventoryProcessor {
        InventoryProcessor {
            warehouse: self.clone(),
        }
    }

    pub fn applier(&self) -> InventoryApplier {
        InventoryApplier {
            warehouse: self.clone(),
        }
    }
}

// =============================================================================
// Processor and Applier
// =============================================================================

pub struct InventoryProcessor {
    warehouse: Warehouse,
}

impl Capability for InventoryProcessor {
    fn name(&self) -> &str {
        "inventory"
    }
}

impl CommandProcessor for InventoryProcessor {
    fn on_command(
        &mut self,
        command: &CommandRecord<'_>,
        router: &mut EventRouter<'_>,
    ) -> Result<()> {
        let text = command
            .payload_str()
            .context("inventory commands are UTF-8")?;
        let (item, quantity) = parse_line(text)?;
        if quantity <= 0 {
            bail!("quantity must be positive, got {quantity}");
        }

        let level = self.warehouse.level(item);
        let next = match command.payload_type() {
            ORDER if quantity > level => {
                debug!(
                    source_id = command.source_id(),
                    item, quantity, level, "order cannot be filled"
                );
                router.abort();
                return Ok(());
            }
            ORDER => level - quantity,
            RESTOCK => level + quantity,
            other => bail!("unknown inventory payload type {other}"),
        };
        router.route(STOCK, format!("{item}:{next}").as_bytes())?;
        Ok(())
    }
}

pub struct InventoryApplier {
    warehouse: Warehouse,
}

impl Capability for InventoryApplier {
    fn name(&self) -> &str {
        "inventory"
    }
}

impl EventApplier for InventoryApplier {
    fn on_event(&mut self, event: &EventRecord<'_>) {
        if event.payload_type() != STOCK {
            return;
        }
        if let Some(Ok((item, level))) = event.payload_str().map(parse_line) {
            self.warehouse
                .stock
                .borrow_mut()
                .insert(item.to_string(), level);
        }
    }
}

// =============================================================================
// Reorder Output
// =============================================================================

/// Loops a restock back in when an item drops below a threshold.
pub struct ReorderOutput {
    threshold: i64,
    batch: i64,
    loopback_source_id: SourceId,
}

impl ReorderOutput {
    pub fn new(threshold: i64, batch: i64, loopback_source_id: SourceId) -> Self {
        Self {
            threshold,
            batch,
            loopback_source_id,
        }
    }
}

impl Capability for ReorderOutput {
    fn name(&self) -> &str {
        "reorder"
    }
}

impl Output for ReorderOutput {
    fn publish(&mut self, event: &EventRecord<'_>, ctx: &mut OutputContext<'_, '_>) -> Result<Ack> {
        // replayed levels were already handled before the restart
        if event.payload_type() != STOCK || ctx.is_replay() {
            return Ok(Ack::Ignored);
        }
        let (item, level) = parse_line(event.payload_str().context("stock events are UTF-8")?)?;
        if level >= self.threshold {
            return Ok(Ack::Ignored);
        }
        // one restock at a time
        if ctx.sender().has_in_flight_command_for(self.loopback_source_id) {
            return Ok(Ack::Ignored);
        }

        let sequence = ctx.loopback(RESTOCK, format!("{item}:{}", self.batch).as_bytes())?;
        info!(item, level, batch = self.batch, sequence, "reorder sent");
        Ok(Ack::Committed)
    }
}

// =============================================================================
// Workload
// =============================================================================

/// Deterministic command generator.
pub struct Workload {
    rng: fastrand::Rng,
    sources: SourceId,
}

impl Workload {
    pub fn new(seed: u64, sources: SourceId) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(seed),
            sources: sources.max(1),
        }
    }

    /// The next `(source_id, payload_type, payload)` to send.
    pub fn next_command(&mut self) -> (SourceId, PayloadType, String) {
        let source_id = self.rng.i32(1..=self.sources);
        let item = ITEMS[self.rng.usize(..ITEMS.len())];
        if self.rng.u8(0..10) < 8 {
            (source_id, ORDER, format!("{item}:{}", self.rng.i64(1..=5)))
        } else {
            (source_id, RESTOCK, format!("{item}:{}", self.rng.i64(1..=10)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("bolt:3").unwrap(), ("bolt", 3));
        assert!(parse_line("bolt").is_err());
        assert!(parse_line("bolt:many").is_err());
    }

    #[test]
    fn test_workload_is_deterministic() {
        let mut a = Workload::new(9, 3);
        let mut b = Workload::new(9, 3);
        for _ in 0..50 {
            let command = a.next_command();
            assert!((1..=3).contains(&command.0));
            assert_eq!(command, b.next_command());
        }
    }
}
