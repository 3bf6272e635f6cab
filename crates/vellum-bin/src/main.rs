//! Vellum demo driver.
//!
//! Boots the viewer engine against the synthetic document provider and an
//! in-memory host surface, then walks through a scripted scroll/zoom
//! session printing engine statistics. Useful for exercising the full
//! pipeline outside a test harness and for reading the tracing output.

use std::path::Path;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use core_dom::HostSurface;
use core_events::EventKind;
use core_instance::{Environment, InstanceHandle, LoadOptions, Registry};
use core_pool::{FixedGauge, MemoryGauge};
use core_provider::DocumentSource;
use core_provider::synthetic::{SyntheticConfig, SyntheticProvider};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "vellum", version, about = "Vellum viewer engine demo")]
struct Args {
    /// Synthetic document page count.
    #[arg(long, default_value_t = 120)]
    pages: u32,
    /// Simulated decoder latency per render pass, in milliseconds.
    #[arg(long, default_value_t = 2)]
    latency_ms: u64,
    /// Page to scroll to during the session.
    #[arg(long, default_value_t = 50)]
    scroll_to: u32,
    /// Zoom level applied after the scroll.
    #[arg(long, default_value_t = 2.0)]
    zoom: f32,
    /// Simulate memory pressure (heap ratio) near the end of the session.
    #[arg(long)]
    pressure: bool,
    /// Open a second viewer to demonstrate instance isolation.
    #[arg(long)]
    second_viewer: bool,
}

struct AppStartup {
    log_guard: Option<WorkerGuard>,
}

impl AppStartup {
    fn new() -> Self {
        Self { log_guard: None }
    }

    fn configure_logging(&mut self) -> Result<()> {
        let log_dir = Path::new(".");
        let log_path = log_dir.join("vellum.log");
        if log_path.exists() {
            let _ = std::fs::remove_file(&log_path);
        }

        let file_appender = tracing_appender::rolling::never(log_dir, "vellum.log");
        let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
        match tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(nb_writer)
            .try_init()
        {
            Ok(_) => {
                self.log_guard = Some(guard);
            }
            Err(_err) => {
                // Global subscriber already installed; drop the guard so the
                // writer shuts down.
            }
        }
        Ok(())
    }

    fn install_panic_hook() {
        static HOOK: Once = Once::new();
        HOOK.call_once(|| {
            let previous = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |panic_info| {
                tracing::error!(target: "runtime", %panic_info, "panic");
                previous(panic_info);
            }));
        });
    }
}

fn print_stats(label: &str, handle: &InstanceHandle) {
    let stats = handle.stats();
    println!(
        "[{label}] page {:>3}  scale {:<4}  materialized {:>2}  queued {:>2}  canvases {}/{} ({:.1} MB)  bitmaps {}/{}",
        stats.virtualizer.current_page,
        stats.virtualizer.scale,
        stats.virtualizer.materialized,
        stats.virtualizer.queued,
        stats.canvas_pool.in_use,
        stats.canvas_pool.total,
        stats.canvas_pool.estimated_mb(),
        stats.bitmap_pool.in_use,
        stats.bitmap_pool.total,
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut startup = AppStartup::new();
    startup.configure_logging()?;
    AppStartup::install_panic_hook();
    let args = Args::parse();
    info!(target: "runtime", ?args, "startup");

    let surface = HostSurface::with_device_pixel_ratio(2.0);
    surface.register_container("demo-a");
    surface.register_container("demo-b");
    let provider = Arc::new(SyntheticProvider::new(SyntheticConfig {
        page_count: args.pages,
        render_latency: Duration::from_millis(args.latency_ms),
        ..Default::default()
    }));
    let gauge = Arc::new(FixedGauge::default());
    let registry = Registry::new(
        Environment::new(surface.clone(), provider)
            .with_gauge(Arc::clone(&gauge) as Arc<dyn MemoryGauge>),
    );

    let handle = registry
        .load(LoadOptions::new(
            "demo-a",
            DocumentSource::Url("synthetic://demo".into()),
        ))
        .await?;
    handle.events().on(EventKind::PageChange, |env| {
        tracing::debug!(target: "runtime", event = ?env.event, "page_change");
        Ok(())
    });
    handle.quiesce().await;
    print_stats("loaded", &handle);

    let second = if args.second_viewer {
        let second = registry
            .load(LoadOptions::new(
                "demo-b",
                DocumentSource::Url("synthetic://demo-b".into()),
            ))
            .await?;
        second.quiesce().await;
        print_stats("second", &second);
        Some(second)
    } else {
        None
    };

    // Scripted scroll: a burst of intermediate offsets, then settle.
    let target = args.scroll_to.clamp(1, args.pages);
    println!("scrolling to page {target}...");
    let page_height = 792.0 + 15.0;
    let target_top = 15.0 + (target.saturating_sub(1)) as f32 * page_height;
    for step in 1..=10 {
        let top = target_top * step as f32 / 10.0;
        handle.scroll_to(top).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    handle.go_to_page(target).await;
    handle.quiesce().await;
    print_stats("scrolled", &handle);

    println!("zooming to {}x...", args.zoom);
    handle.set_zoom(args.zoom);
    handle.quiesce().await;
    print_stats("zoomed", &handle);

    if args.pressure {
        println!("simulating heap pressure...");
        gauge.set_ratio(0.9);
        tokio::time::sleep(Duration::from_secs(3)).await;
        print_stats("pressure", &handle);
        gauge.set_ratio(0.0);
    }

    if let Some(second) = &second {
        print_stats("second-after", second);
    }

    let stats = registry.stats();
    println!(
        "registry: {} active instance(s), torn_down = {}",
        stats.active_instances, stats.torn_down
    );
    registry.destroy();
    println!("done; tracing written to vellum.log");
    Ok(())
}
