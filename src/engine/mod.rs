//! The engine wires three cooperating tasks together: an event source
//! feeding a router, a collector for page-level interaction events and an
//! aggregator for tab-level session accounting. All tasks share one
//! cancellation token and one on-disk store.

use std::path::PathBuf;

use anyhow::Result;
use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::utils::clock::{Clock, DefaultClock};

pub mod aggregator;
pub mod budget;
pub mod collector;
pub mod events;
pub mod storage;
pub mod telemetry;
pub mod typing;

use aggregator::{AggregatorEvent, LogPresenter, Presenter, SessionAggregator};
use collector::EventCollector;
use events::{EventSource, HostEvent, PageEvent, StdinEventSource};
use storage::store::{BehaviorStore, JsonStore};
use telemetry::{Backend, HttpBackend};

/// Represents the starting point for the tracking engine. Runs until the
/// host closes the event pipe or the process receives a shutdown signal.
pub async fn start_engine(dir: PathBuf, backend_url: String) -> Result<()> {
    let store = JsonStore::new(dir.clone())?;
    let backend = HttpBackend::new(backend_url);
    let shutdown = CancellationToken::new();

    let (page_tx, page_rx) = mpsc::channel::<PageEvent>(64);
    let (agg_tx, agg_rx) = mpsc::channel::<AggregatorEvent>(64);

    let collector = create_collector(page_rx, agg_tx.clone(), store.clone(), &shutdown, DefaultClock);
    let aggregator = create_aggregator(
        agg_rx,
        store,
        backend,
        LogPresenter,
        &shutdown,
        DefaultClock,
    );

    let (_, router_result, collector_result, aggregator_result) = tokio::join!(
        detect_shutdown(shutdown.clone()),
        route_events(StdinEventSource::new(), page_tx, agg_tx, shutdown.clone()),
        collector.run(),
        aggregator.run(),
    );

    if let Err(e) = router_result {
        error!("Event router got an error {:?}", e);
    }
    if let Err(e) = collector_result {
        error!("Collector module got an error {:?}", e);
    }
    if let Err(e) = aggregator_result {
        error!("Aggregator module got an error {:?}", e);
    }

    Ok(())
}

fn create_collector<S: BehaviorStore>(
    events: mpsc::Receiver<PageEvent>,
    aggregator: mpsc::Sender<AggregatorEvent>,
    store: S,
    shutdown: &CancellationToken,
    clock: impl Clock,
) -> EventCollector<S> {
    EventCollector::new(events, aggregator, store, shutdown.clone(), Box::new(clock))
}

fn create_aggregator<S: BehaviorStore, B: Backend, P: Presenter>(
    receiver: mpsc::Receiver<AggregatorEvent>,
    store: S,
    backend: B,
    presenter: P,
    shutdown: &CancellationToken,
    clock: impl Clock,
) -> SessionAggregator<S, B, P> {
    SessionAggregator::new(
        receiver,
        store,
        backend,
        presenter,
        shutdown.clone(),
        Box::new(clock),
    )
}

/// Detects signals sent to the process and cancels the engine.
async fn detect_shutdown(cancellation: CancellationToken) {
    select! {
        _ = tokio::signal::ctrl_c() => {
            cancellation.cancel();
        },
        _ = cancellation.cancelled() => {}
    };
}

/// Splits host events between the collector and the aggregator. When the
/// source dries up the whole engine is cancelled; a dead host means there
/// is nothing left to track.
async fn route_events(
    mut source: impl EventSource,
    collector: mpsc::Sender<PageEvent>,
    aggregator: mpsc::Sender<AggregatorEvent>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let event = select! {
            _ = shutdown.cancelled() => break,
            event = source.next_event() => match event {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    warn!("Event source failed: {e:?}");
                    break;
                }
            },
        };

        let delivered = match split_event(event) {
            RoutedEvent::Page(event) => collector.send(event).await.is_ok(),
            RoutedEvent::Aggregator(event) => aggregator.send(event).await.is_ok(),
        };
        if !delivered {
            break;
        }
    }
    shutdown.cancel();
    Ok(())
}

enum RoutedEvent {
    Page(PageEvent),
    Aggregator(AggregatorEvent),
}

fn split_event(event: HostEvent) -> RoutedEvent {
    match event {
        HostEvent::PageLoaded { url } => RoutedEvent::Page(PageEvent::Loaded { url }),
        HostEvent::Click => RoutedEvent::Page(PageEvent::Click),
        HostEvent::Scroll => RoutedEvent::Page(PageEvent::Scroll),
        HostEvent::MouseMove => RoutedEvent::Page(PageEvent::MouseMove),
        HostEvent::KeyDown { key } => RoutedEvent::Page(PageEvent::KeyDown { key }),
        HostEvent::VisibilityChanged { hidden } => {
            RoutedEvent::Page(PageEvent::VisibilityChanged { hidden })
        }
        HostEvent::BeforeUnload => RoutedEvent::Page(PageEvent::BeforeUnload),
        HostEvent::TabSwitched => RoutedEvent::Aggregator(AggregatorEvent::TabSwitched),
        HostEvent::NavigationCompleted { url, title } => {
            RoutedEvent::Aggregator(AggregatorEvent::NavigationCompleted { url, title })
        }
        HostEvent::FocusLost => RoutedEvent::Aggregator(AggregatorEvent::FocusLost),
        HostEvent::QuestionAnswered { answer, domain } => {
            RoutedEvent::Aggregator(AggregatorEvent::QuestionAnswered { answer, domain })
        }
    }
}
