use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio::time;

use pulsetrack_lib::{
    models::TimerPreset,
    open_storage,
    relay::{MemoryRelay, RemoteViewer, ShareCode, SharingSession},
    sensor::{central::central_channel, ConnectionNotice, SyntheticCentral, SyntheticProfile},
    session::{LogCueSink, SessionSnapshot},
    utils::init_logging,
    zones::ZoneConfiguration,
    AppContext,
};

/// Runs a workout against the synthetic heart-rate sensor and logs the sets.
#[derive(Parser)]
#[command(name = "pulsetrack")]
struct Cli {
    /// Preset as WORK_SECS,REST_SECS,SETS. Without it a manual session runs.
    #[arg(long)]
    preset: Option<String>,

    /// Run the two-minute cooldown after the last set.
    #[arg(long)]
    cooldown: bool,

    /// Length of a manual session in seconds.
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Max heart rate used to build the zone bands.
    #[arg(long)]
    max_hr: Option<u16>,

    /// Also push the session through an in-process relay and view it back.
    #[arg(long)]
    share: bool,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

fn parse_preset(raw: &str, include_cooldown: bool) -> Result<TimerPreset> {
    let parts: Vec<u64> = raw
        .split(',')
        .map(|part| part.trim().parse::<u64>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("preset '{raw}' must be WORK_SECS,REST_SECS,SETS"))?;
    let [work, rest, sets] = parts.as_slice() else {
        bail!("preset '{raw}' must have exactly three fields");
    };
    let preset = TimerPreset::new(
        "cli",
        Duration::from_secs(*work),
        Duration::from_secs(*rest),
        u32::try_from(*sets).context("set count out of range")?,
    )
    .with_cooldown(include_cooldown);
    preset.validate()?;
    Ok(preset)
}

fn log_summary(snapshot: &SessionSnapshot) {
    for record in &snapshot.records {
        info!(
            "{:>4}  {:>6.1}s  rep={:?} avg={:?} max={:?} min={:?}",
            record.label(),
            record.segment_duration.as_secs_f64(),
            record.representative_bpm(),
            record.stats.avg,
            record.stats.max,
            record.stats.min
        );
    }
    info!(
        "total {:.1}s, recovery {:?}",
        snapshot.elapsed.as_secs_f64(),
        snapshot.heart_rate_recovery
    );
    if let Some(zones) = snapshot.time_in_zones {
        for (i, spent) in zones.iter().enumerate() {
            info!("zone {}: {}s", i + 1, spent.as_secs());
        }
    }
}

async fn wait_for_completion(ctx: &AppContext) -> Result<SessionSnapshot> {
    let mut snapshots = ctx.session.watch_snapshot();
    loop {
        if snapshots.borrow_and_update().completed {
            return Ok(ctx.session.snapshot().await);
        }
        snapshots
            .changed()
            .await
            .map_err(|_| anyhow!("session controller went away"))?;
    }
}

async fn connect_first_candidate(ctx: &AppContext) -> Result<()> {
    let mut notices = ctx.connection.subscribe_notices();
    ctx.connection.start_scan()?;

    let device = time::timeout(Duration::from_secs(10), async {
        loop {
            match notices.recv().await {
                Ok(ConnectionNotice::CandidateFound(advertisement)) => return Ok(advertisement),
                Ok(_) => continue,
                Err(err) => return Err(anyhow!("notice stream closed: {err}")),
            }
        }
    })
    .await
    .context("no heart-rate monitor found")??;

    info!(
        "Connecting to {} ({})",
        device.name.as_deref().unwrap_or("unnamed"),
        device.device
    );
    ctx.connection.connect(device.device).await?;

    time::timeout(Duration::from_secs(10), async {
        while ctx.connection.current_reading().is_none() {
            time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await
    .context("sensor connected but never streamed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("pulsetrack"));
    let (settings, db) = open_storage(&data_dir)?;

    let (events_tx, events_rx) = central_channel();
    let central = Arc::new(SyntheticCentral::new(events_tx, SyntheticProfile::default()));
    let ctx = AppContext::bootstrap(settings, db, central, events_rx, Arc::new(LogCueSink)).await?;

    if let Some(max_hr) = cli.max_hr {
        let zones = ZoneConfiguration::from_max_heart_rate(max_hr)?;
        ctx.db.save_zone_configuration(&zones).await?;
        ctx.session.load_zones(Some(zones)).await?;
    }

    connect_first_candidate(&ctx).await?;

    let sharing = if cli.share {
        let relay = Arc::new(MemoryRelay::new());
        let code = ShareCode::generate();
        let relay_config = ctx.settings.config().relay;
        let sharing =
            SharingSession::start(relay.clone(), code.clone(), ctx.session.watch_snapshot(), &relay_config);
        let viewer = RemoteViewer::start(relay, code, &relay_config);
        Some((sharing, viewer))
    } else {
        None
    };

    if let Some(raw) = cli.preset.as_deref() {
        let preset = parse_preset(raw, cli.cooldown)?;
        info!(
            "Running preset: {} x {}s work / {}s rest",
            preset.set_count,
            preset.work_duration().as_secs(),
            preset.rest_duration().as_secs()
        );
        ctx.session.load_preset(preset).await?;
        ctx.session.start().await?;
    } else {
        let half = Duration::from_secs(cli.duration.max(2) / 2);
        ctx.session.start().await?;
        time::sleep(half).await;
        ctx.session.capture_rest_set().await?;
        time::sleep(half).await;
        if cli.cooldown {
            ctx.session.end().await?;
        } else {
            ctx.session.stop_and_complete().await?;
        }
    }

    let snapshot = wait_for_completion(&ctx).await?;
    log_summary(&snapshot);
    if let Some(rmssd) = ctx.connection.recent_rmssd() {
        info!("RMSSD over recent beats: {rmssd:.1} ms");
    }

    if let Some((sharing, viewer)) = sharing {
        if let Some(payload) = viewer.latest_payload() {
            info!("Remote viewer last saw {} bpm", payload.latest_bpm);
        }
        if let Some(err) = sharing.take_failure() {
            warn!("Sharing ended early: {err}");
        }
        sharing.stop().await?;
        viewer.stop().await?;
    }

    ctx.shutdown().await
}
