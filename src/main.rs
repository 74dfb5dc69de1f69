//! Headless demo: runs a small acquisition on simulated hardware and renders
//! progress from the UI thread.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use scopekit::scopekit_core::data::{ChannelGroup, ChannelSpec, Region};
use scopekit::scopekit_core::{
    AcquisitionConfig, AcquisitionPhase, Command, Event, EventFilter, EventKind, RunFilter, State,
    UiDispatcher, UiEventBus,
};
use scopekit::scopekit_services::CollectingSink;
use scopekit::scopekit_settings::EngineSettings;
use scopekit::{init_logging, ControlPlane, BUILD_DATE, VERSION};

fn demo_config() -> AcquisitionConfig {
    let mut config = AcquisitionConfig::new(
        vec![
            Region::new("A1", 12.0, 9.0, 1.5),
            Region::new("A2", 21.0, 9.0, 1.5),
        ],
        vec![
            ChannelGroup::sequential(
                "fluorescence",
                vec![
                    ChannelSpec::new("DAPI", 20.0, 405, 30.0).with_filter(1),
                    ChannelSpec::new("GFP", 30.0, 488, 45.0).with_filter(2),
                ],
            ),
            ChannelGroup::simultaneous(
                "multiband",
                vec![
                    ChannelSpec::new("RFP", 40.0, 561, 50.0).with_trigger_offset(2.0),
                    ChannelSpec::new("Cy5", 40.0, 638, 50.0),
                ],
            ),
        ],
    );
    config.z_stack.planes = 3;
    config.z_stack.step_um = 2.0;
    config
}

fn main() -> anyhow::Result<()> {
    let settings = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => EngineSettings::load_from_file(&path)?,
        None => EngineSettings::load_or_default(&EngineSettings::default_path()?)?,
    };
    init_logging(&settings.logging)?;
    tracing::info!("ScopeKit {} (built {})", VERSION, BUILD_DATE);

    let sink = Arc::new(CollectingSink::new());
    let (plane, _devices) = ControlPlane::simulated(&settings, sink.clone());

    let dispatcher = Arc::new(UiDispatcher::new());
    let ui = UiEventBus::new(plane.bus.clone(), dispatcher.clone());
    let done = Arc::new(AtomicBool::new(false));

    let finished = done.clone();
    let runs = Mutex::new(RunFilter::new());
    ui.subscribe(
        EventFilter::Kinds(vec![
            EventKind::ModeChanged,
            EventKind::AcquisitionStateChanged,
            EventKind::AcquisitionProgress,
            EventKind::AcquisitionFinished,
            EventKind::CommandRejected,
        ]),
        move |event| {
            let Event::State(state) = event else {
                return;
            };
            if !runs.lock().accept(state) {
                return;
            }
            match &state.state {
                State::AcquisitionProgress(p) => {
                    tracing::info!(
                        "{:5.1}% {} {} (eta {:.1} s)",
                        p.percent,
                        p.indices,
                        p.channel,
                        p.eta_s.unwrap_or(0.0)
                    );
                }
                State::AcquisitionFinished(f) => {
                    tracing::info!(
                        "Run finished: success={} aborted={} units={}",
                        f.success,
                        f.aborted,
                        f.units_done
                    );
                }
                State::AcquisitionStateChanged(s) if s.phase == AcquisitionPhase::Idle => {
                    finished.store(true, Ordering::SeqCst)
                }
                State::AcquisitionStateChanged(s) => tracing::info!("Phase: {}", s.phase),
                State::CommandRejected { command, reason } => {
                    tracing::error!("{:?} rejected: {}", command, reason);
                    finished.store(true, Ordering::SeqCst);
                }
                other => tracing::info!("{:?}", other.kind()),
            }
        },
    );

    ui.publish(Command::StartAcquisition {
        config: demo_config(),
    });
    let completed = dispatcher.run_until(Duration::from_secs(60), || done.load(Ordering::SeqCst));
    if !completed {
        tracing::warn!("Demo acquisition did not finish in time");
        ui.publish(Command::StopAcquisition);
        dispatcher.run_for(Duration::from_secs(2));
    }

    tracing::info!("Captured {} frames", sink.len());
    drop(ui);
    plane.shutdown();
    Ok(())
}
