use moviekit_codec::{MIME_AVC, MIME_RAW, OutputSurface, RecordingSink, SoftwareCodecFactory};
use moviekit_content::{
    ContentConfig, ContentError, ContentKind, ContentRegistry, EightRects, FrameSource,
    GenerateEvent, MovieOverrides, Sliders,
};
use moviekit_video::{
    ChannelFeedback, EncodeError, MoviePlayer, PacingMode, PlayTask, SpeedController,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn small_config(dir: &Path) -> ContentConfig {
    ContentConfig {
        mime: Some(MIME_RAW.to_owned()),
        eight_rects: MovieOverrides {
            width: Some(32),
            height: Some(16),
            ..MovieOverrides::default()
        },
        sliders: MovieOverrides {
            width: Some(24),
            height: Some(32),
            frame_count: Some(10),
            ..MovieOverrides::default()
        },
        ..ContentConfig::with_output_dir(dir)
    }
}

#[test]
fn create_all_reports_ordered_progress() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ContentRegistry::software(small_config(dir.path())));
    assert!(!registry.is_created());

    let mut progress = Vec::new();
    let movies = registry
        .create_all()
        .unwrap()
        .wait_with_progress(|index, percent| progress.push((index, percent)))
        .unwrap();

    assert_eq!(movies.len(), 2);
    assert_eq!(movies[0].kind, ContentKind::EightRects);
    assert_eq!(movies[0].samples, 32);
    assert_eq!(movies[1].samples, 10);
    assert!(registry.is_created());
    assert!(registry.has(ContentKind::EightRects));
    assert_eq!(registry.get(ContentKind::Sliders), Some(movies[1].clone()));

    assert_eq!(progress.first(), Some(&(0, 0)));
    assert_eq!(progress.last(), Some(&(1, 100)));
    assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn batch_stops_at_first_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = ContentConfig {
        mime: Some(MIME_AVC.to_owned()),
        ..small_config(dir.path())
    };
    let registry = Arc::new(ContentRegistry::software(config));
    let task = registry
        .generate(&[ContentKind::Sliders, ContentKind::EightRects])
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = task.events().recv_blocking() {
        let finished = matches!(event, GenerateEvent::Finished(_));
        events.push(event);
        if finished {
            break;
        }
    }

    assert!(matches!(
        events.as_slice(),
        [
            GenerateEvent::Progress { index: 0, percent: 0 },
            GenerateEvent::Finished(Err(ContentError::Encode(EncodeError::Codec(_)))),
        ]
    ));
    assert!(!registry.has(ContentKind::Sliders));
    assert!(!registry.has(ContentKind::EightRects));
}

#[test]
fn generated_movie_plays_back_with_its_timestamps() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ContentRegistry::software(small_config(dir.path()));
    let movie = registry
        .prepare(ContentKind::EightRects, &mut |_| {})
        .unwrap();

    let sink = Arc::new(RecordingSink::new());
    let mut player = MoviePlayer::new(
        &movie.path,
        Arc::new(SoftwareCodecFactory::default()),
        OutputSurface::Sink(sink.clone()),
        SpeedController::new(PacingMode::FreeRunning),
    )
    .unwrap();
    assert_eq!(player.video_size(), (32, 16));

    let stats = player.play().unwrap();
    assert_eq!(stats.frames_rendered, 32);

    let source = EightRects::new(movie.spec.clone());
    let expected: Vec<i64> = (0..32)
        .map(|index| source.presentation_time_nsec(index) / 1000)
        .collect();
    assert_eq!(sink.timestamps(), expected);

    // Frame 0 highlights the top-left cell.
    let first = &sink.frames()[0];
    assert_eq!(first.pixel(0, 0), Some([236, 50, 186, 255]));
    assert_eq!(first.pixel(31, 15), Some([0, 136, 0, 255]));
}

#[test]
fn looping_playback_repeats_the_movie() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ContentRegistry::software(small_config(dir.path()));
    let movie = registry.prepare(ContentKind::Sliders, &mut |_| {}).unwrap();

    let sink = Arc::new(RecordingSink::new());
    let player = MoviePlayer::new(
        &movie.path,
        Arc::new(SoftwareCodecFactory::default()),
        OutputSurface::Sink(sink.clone()),
        SpeedController::new(PacingMode::FreeRunning),
    )
    .unwrap();
    player.set_loop_mode(true);
    let (feedback, results) = ChannelFeedback::new();
    let task = PlayTask::execute(player, feedback).unwrap();

    // Halfway into the second pass.
    while sink.len() < 15 {
        std::thread::sleep(Duration::from_millis(1));
    }
    task.request_stop();
    task.wait_for_stop();
    let stats = results.recv_blocking().unwrap().unwrap();
    task.join().unwrap();
    assert!(stats.loops >= 1);

    let source = Sliders::new(movie.spec.clone());
    let schedule: Vec<i64> = (0..10)
        .map(|index| source.presentation_time_nsec(index) / 1000)
        .collect();
    let timestamps = sink.timestamps();
    assert_eq!(&timestamps[..10], schedule.as_slice());
    assert_eq!(&timestamps[10..15], &schedule[..5]);

    let frames = sink.frames();
    assert_ne!(frames[0].data, frames[1].data);
    for index in 0..5 {
        assert_eq!(frames[10 + index].data, frames[index].data);
    }
}

#[test]
fn unknown_ids_are_configuration_errors() {
    assert!(matches!(
        ContentKind::from_id(2),
        Err(ContentError::UnknownContent(2))
    ));
}
