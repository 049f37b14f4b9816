use std::{
    collections::BTreeSet,
    io::Write,
    thread,
    time::Duration,
};

use tirex_tracker::{
    fetch_info, measure_infos, provider_infos, start_tracking, stop_tracking, track, try_track,
    Error, Measure, ProviderId, ResultType, Results, TrackError, TrackedProcess, Tracker,
    TrackerConfig,
};

fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}

fn assert_wall_clock(results: &Results) {
    assert!(!results.is_empty());
    let entry = results.get(Measure::TimeElapsedWallClockMs).unwrap();
    assert_eq!(entry.source, Measure::TimeElapsedWallClockMs);
    assert_eq!(entry.result_type, ResultType::Floating);
    let elapsed: f64 = entry.value.parse().unwrap();
    assert!(elapsed > 0.0);
}

#[test]
fn provider_infos_are_listed() {
    let infos = provider_infos();
    assert!(!infos.is_empty());
    let ids: BTreeSet<_> = infos.iter().map(|p| p.id).collect();
    assert_eq!(ids.len(), ProviderId::ALL.len());
}

#[test]
fn measure_infos_cover_every_measure() {
    let infos = measure_infos();
    assert!(!infos.is_empty());
    for measure in Measure::ALL {
        let info = infos.get(measure).unwrap();
        assert!(!info.description.is_empty(), "{measure}");
    }
}

#[test]
fn fetch_os_name() {
    init_logger();
    let results = fetch_info(&[Measure::OsName]).unwrap();

    assert!(!results.is_empty());
    let entry = results.get(Measure::OsName).unwrap();
    assert_eq!(entry.source, Measure::OsName);
    assert_eq!(entry.result_type, ResultType::String);
    assert!(!entry.value.is_empty());
}

#[test]
fn empty_requests_are_rejected() {
    assert!(matches!(fetch_info(&[]), Err(Error::EmptyRequest)));
    assert!(matches!(start_tracking(&[]), Err(Error::EmptyRequest)));
}

#[test]
fn start_and_stop() {
    init_logger();
    let reference = start_tracking(&[Measure::TimeElapsedWallClockMs]).unwrap();
    thread::sleep(Duration::from_millis(100));
    let results = stop_tracking(reference).unwrap();

    assert_wall_clock(&results);
    let elapsed = results.get(Measure::TimeElapsedWallClockMs).unwrap().as_f64().unwrap();
    assert!(elapsed >= 100.0);
}

#[test]
fn stopping_twice_fails() {
    let reference = start_tracking(&[Measure::TimeElapsedWallClockMs]).unwrap();
    stop_tracking(reference).unwrap();
    match stop_tracking(reference) {
        Err(Error::UnknownSession(r)) => assert_eq!(r, reference),
        other => panic!("expected UnknownSession, got {other:?}"),
    }
}

#[test]
fn track_a_block() {
    init_logger();
    let (results, ()) = track(&[Measure::TimeElapsedWallClockMs], || {
        thread::sleep(Duration::from_millis(100))
    })
    .unwrap();
    assert_wall_clock(&results);
}

#[test]
fn failing_block_propagates_its_error() {
    let outcome = try_track(&[Measure::TimeElapsedWallClockMs], || {
        Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
    });
    let error = outcome.unwrap_err().into_work_error().unwrap();
    assert_eq!(error.to_string(), "boom");
}

#[test]
fn concurrent_sessions_are_independent() {
    init_logger();
    let measures = [Measure::TimeElapsedWallClockMs, Measure::RamUsedProcessKb];

    let references = crossbeam::thread::scope(|s| {
        let handles: Vec<_> = (0..8_u64)
            .map(|i| {
                s.spawn(move |_| {
                    let reference = start_tracking(&measures).unwrap();
                    thread::sleep(Duration::from_millis(10 * (i % 3)));
                    let results = stop_tracking(reference).unwrap();
                    assert_wall_clock(&results);
                    reference
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    })
    .unwrap();

    let distinct: BTreeSet<_> = references.iter().map(|r| r.as_raw()).collect();
    assert_eq!(distinct.len(), references.len());
}

#[test]
fn scoped_tracking_matches_start_and_stop() {
    init_logger();
    let config = TrackerConfig {
        providers: vec!["os|time|memory|cpu".into()],
        ..TrackerConfig::default()
    };
    let tracker = Tracker::new(config).unwrap();
    let measures = [
        Measure::OsName,
        Measure::TimeElapsedWallClockMs,
        Measure::RamUsedSystemMb,
        Measure::RamAvailableSystemMb,
        Measure::CpuAvailableSystemCores,
        Measure::CpuArchitecture,
    ];

    let (scoped, ()) = tracker
        .track(&measures, || thread::sleep(Duration::from_millis(20)))
        .unwrap();
    let reference = tracker.start_tracking(&measures).unwrap();
    thread::sleep(Duration::from_millis(20));
    let explicit = tracker.stop_tracking(reference).unwrap();

    let keys: BTreeSet<_> = scoped.measures().collect();
    assert_eq!(keys, explicit.measures().collect::<BTreeSet<_>>());
    assert!(keys.contains(&Measure::TimeElapsedWallClockMs));
    for measure in keys {
        let (a, b) = (scoped.get(measure).unwrap(), explicit.get(measure).unwrap());
        assert_eq!(a.source, b.source);
        assert_eq!(a.result_type, b.result_type);
    }
}

#[test]
#[cfg(unix)]
fn busy_child_process_is_tracked() {
    init_logger();
    let mut child = std::process::Command::new("sh")
        .args(["-c", "i=0; while [ $i -lt 200000 ]; do i=$((i+1)); done"])
        .spawn()
        .unwrap();
    let config = TrackerConfig {
        providers: vec!["time".into()],
        process: TrackedProcess::Child(child.id()),
        ..TrackerConfig::default()
    };
    let tracker = Tracker::new(config).unwrap();
    let (results, status) = tracker
        .try_track(&[Measure::TimeElapsedUserMs, Measure::TimeElapsedWallClockMs], || {
            child.wait()
        })
        .unwrap();

    assert!(status.success());
    assert_wall_clock(&results);
    let user = results.get(Measure::TimeElapsedUserMs).unwrap().as_f64().unwrap();
    assert!(user > 0.0);
}

#[test]
fn filtered_tracker_omits_disabled_providers() {
    init_logger();
    let config = TrackerConfig {
        providers: vec!["os|time".into()],
        ..TrackerConfig::default()
    };
    let tracker = Tracker::new(config).unwrap();
    let (results, _) = tracker
        .track(&[Measure::OsName, Measure::TimeElapsedWallClockMs, Measure::GitIsRepo], || ())
        .unwrap();
    assert!(results.contains(Measure::OsName));
    assert!(results.contains(Measure::TimeElapsedWallClockMs));
    assert!(!results.contains(Measure::GitIsRepo));
    assert!(tracker.live_sessions().is_empty());
}

#[test]
fn tracker_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "poll_interval_ms = 20\nproviders = [\"memory\"]").unwrap();
    let config = TrackerConfig::load(file.path()).unwrap();
    assert_eq!(config.poll_interval(), Duration::from_millis(20));

    let tracker = Tracker::new(config).unwrap();
    let (results, buffer) = tracker
        .track(&[Measure::RamAvailableSystemMb, Measure::OsName], || vec![0_u8; 1024])
        .unwrap();
    assert_eq!(buffer.len(), 1024);
    assert!(results.get(Measure::RamAvailableSystemMb).unwrap().as_i64().unwrap() > 0);
    assert!(!results.contains(Measure::OsName));
}

#[test]
fn invalid_provider_filter_is_an_error() {
    let config = TrackerConfig {
        providers: vec!["(".into()],
        ..TrackerConfig::default()
    };
    assert!(matches!(Tracker::new(config), Err(Error::ProviderFilter { .. })));
}

#[test]
fn invalid_tracking_request_does_not_run_work() {
    let mut ran = false;
    let outcome = try_track(&[], || {
        ran = true;
        Ok::<_, std::io::Error>(())
    });
    assert!(matches!(outcome, Err(TrackError::Tracker(Error::EmptyRequest))));
    assert!(!ran);
}

#[test]
fn results_serialize_to_json() {
    let results = fetch_info(&[Measure::OsName, Measure::CpuArchitecture]).unwrap();
    let json: serde_json::Value = serde_json::from_str(&results.to_json()).unwrap();
    assert_eq!(json["OS_NAME"]["type"], "STRING");
    assert_eq!(json["CPU_ARCHITECTURE"]["value"], std::env::consts::ARCH);
}
