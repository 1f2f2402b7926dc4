//! Demonstrates synchronous and asynchronous fan-out, filters and listener eviction.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fanout::{DeliveryError, ErrorCountPolicy, ListenerRegistry};
use shared_pool::SharedPool;

trait StockListener: Send + Sync {
    fn price_changed(&self, symbol: &str, cents: u64) -> Result<(), DeliveryError>;
}

struct Printer {
    name: &'static str,
}

impl StockListener for Printer {
    fn price_changed(&self, symbol: &str, cents: u64) -> Result<(), DeliveryError> {
        println!("[{}] {symbol} is now {cents} cents", self.name);
        Ok(())
    }
}

struct Broken;

impl StockListener for Broken {
    fn price_changed(&self, _symbol: &str, _cents: u64) -> Result<(), DeliveryError> {
        Err(DeliveryError::Failed("connection lost".to_string()))
    }
}

fn publish(registry: &ListenerRegistry<dyn StockListener, &'static str>, cents: u64) {
    registry
        .dispatch()
        .call("price_changed", move |l| l.price_changed("ACME", cents));
}

fn main() {
    println!("=== Synchronous ===");

    let registry = ListenerRegistry::<dyn StockListener, &'static str>::builder()
        .error_policy(ErrorCountPolicy::dropping_messages(2))
        .build();

    let screen: Arc<dyn StockListener> = Arc::new(Printer { name: "screen" });
    let ticker: Arc<dyn StockListener> = Arc::new(Printer { name: "ticker" });
    let broken: Arc<dyn StockListener> = Arc::new(Broken);

    registry.add_with_attachment(&screen, "retail");
    registry.add_with_attachment(&ticker, "pro");
    registry.add(&broken);

    publish(&registry, 1_000);
    println!("Listeners after one failure: {}", registry.len());

    publish(&registry, 1_010);
    println!("Listeners after two failures: {}", registry.len());

    // Only professional listeners get the next update.
    registry.set_filter(|attachment, _message| attachment == Some(&"pro"));
    publish(&registry, 1_020);
    registry.clear_filter();

    println!("=== Asynchronous with delay ===");

    let pool = SharedPool::new();
    let delayed = ListenerRegistry::<dyn StockListener, &'static str>::builder()
        .asynchronous(&pool)
        .delay(Duration::from_millis(100))
        .build();

    delayed.add(&screen);
    publish(&delayed, 990);
    println!("Dispatched, delivery follows shortly");

    thread::sleep(Duration::from_millis(300));
}
