//! End-to-end solver tests on a synthetic field: detections and rendered
//! images of a known pointing must solve back to it.


use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use quadsolve::catalog::write_star_csv;
use quadsolve::star::angular_separation_deg;
use quadsolve::{
    load_indices, reorder, solve_field, solve_field_with_config, solve_image, CatalogIndex, DetectedStar,
    DetectionConfig, IndexHandle, MatchError, QuadIndex, SolveConfig, SolveStatus, StarList,
    WcsResult,
};
use synthetic_sky::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
}

/// Sky position error of a solution against the true pointing at a pixel, degrees.
fn sky_error_deg(wcs: &WcsResult, x: f64, y: f64) -> f64 {
    let truth = truth_wcs();
    let (ra_t, dec_t) = truth.pixel_to_radec(x, y);
    let (ra, dec) = wcs.pixel_to_radec(x, y).unwrap();
    angular_separation_deg(ra, dec, ra_t.to_degrees(), dec_t.to_degrees())
}

fn assert_matches_truth(wcs: &WcsResult) {
    assert!(wcs.solved);
    let corners = [
        (WIDTH as f64 / 2.0, HEIGHT as f64 / 2.0),
        (0.0, 0.0),
        (WIDTH as f64 - 1.0, 0.0),
        (0.0, HEIGHT as f64 - 1.0),
        (WIDTH as f64 - 1.0, HEIGHT as f64 - 1.0),
    ];
    for (x, y) in corners {
        let err = sky_error_deg(wcs, x, y);
        assert!(err < 0.02, "pixel ({x}, {y}) off by {err:.4} deg");
    }
    assert!((wcs.pixel_scale - SCALE_ARCSEC).abs() < 0.2, "scale {}", wcs.pixel_scale);
    assert!(
        (wcs.rotation_deg - truth_wcs().rotation_deg()).abs() < 0.2,
        "rotation {}",
        wcs.rotation_deg
    );
    assert!(wcs.parity);
    assert!(WcsResult::is_on_image(
        wcs.radec_to_pixel(CENTER_RA, CENTER_DEC).unwrap().0,
        wcs.radec_to_pixel(CENTER_RA, CENTER_DEC).unwrap().1,
        WIDTH,
        HEIGHT
    ));
}

#[test]
fn test_solve_synthetic_detections() {
    init_tracing();
    let stars = star_list(60, 0.2, 7);
    let ordered = reorder(&stars);
    let report = solve_field_with_config(&ordered, WIDTH, HEIGHT, &[shared_handle()], &SolveConfig::default());

    println!(
        "status {:?}, depth {:?}, {} quads, {} candidates, {} matches, {:.1} ms",
        report.status,
        report.accepted_depth,
        report.quads_tried,
        report.candidates_verified,
        report.num_matches,
        report.solve_time_ms
    );
    assert_eq!(report.status, SolveStatus::Solved);
    assert!(report.error().is_none());
    assert!(report.accepted_depth.unwrap() <= 60);
    assert!(report.checkpoints_attempted >= 1);
    assert!(report.num_matches >= 20, "{} matches", report.num_matches);
    assert!(report.wcs.log_odds >= 20.0);
    assert_eq!(report.best_log_odds, Some(report.wcs.log_odds));
    assert_matches_truth(&report.wcs);
}

#[test]
fn test_solve_field_returns_wcs() {
    init_tracing();
    let ordered = reorder(&star_list(60, 0.3, 21));
    let wcs = solve_field(&ordered, WIDTH, HEIGHT, &[shared_handle()], 10.0, 180.0, 20.0);
    assert_matches_truth(&wcs);
    assert_eq!(wcs.crpix, (WIDTH as f64 / 2.0 + 1.0, HEIGHT as f64 / 2.0 + 1.0));
}

#[test]
fn test_scale_bounds_exclude_true_scale() {
    init_tracing();
    let ordered = reorder(&star_list(30, 0.2, 7));
    let wcs = solve_field(&ordered, WIDTH, HEIGHT, &[shared_handle()], 60.0, 180.0, 20.0);
    assert!(!wcs.solved);
    assert_eq!(wcs.log_odds, 0.0);
}

#[test]
fn test_solve_rendered_image() {
    init_tracing();
    let pixels = render(1.5, 5.0, 99);
    let report = solve_image(&pixels, &DetectionConfig::default(), &[shared_handle()], &SolveConfig::default())
        .expect("detection failed");
    println!(
        "rendered: {} stars searched, status {:?}, {} matches",
        report.num_stars, report.status, report.num_matches
    );
    assert!(report.num_stars >= 40, "{} detections", report.num_stars);
    assert_eq!(report.status, SolveStatus::Solved);
    assert_matches_truth(&report.wcs);
}

#[test]
fn test_few_stars_exhaust_one_clamped_window() {
    init_tracing();
    let stars = reorder(&star_list(5, 0.2, 3));
    let report = solve_field_with_config(&stars, WIDTH, HEIGHT, &[shared_handle()], &SolveConfig::default());
    assert_eq!(report.status, SolveStatus::Exhausted);
    assert!(!report.wcs.solved);
    assert_eq!(report.checkpoints_attempted, 1);
    assert_eq!(report.last_window, Some((0, 5)));
    assert_eq!(report.accepted_depth, None);
    assert_eq!(report.error(), Some(MatchError::Exhausted { checkpoints: 1 }));
}

#[test]
fn test_insufficient_stars() {
    init_tracing();
    let stars = reorder(&star_list(3, 0.2, 3));
    let report = solve_field_with_config(&stars, WIDTH, HEIGHT, &[shared_handle()], &SolveConfig::default());
    assert_eq!(report.status, SolveStatus::InsufficientStars);
    assert_eq!(report.checkpoints_attempted, 0);
    assert_eq!(report.error(), Some(MatchError::InsufficientStars { found: 3 }));

    let empty = StarList::default();
    let wcs = solve_field(&empty, WIDTH, HEIGHT, &[shared_handle()], 10.0, 180.0, 20.0);
    assert!(!wcs.solved);
}

#[test]
fn test_no_index_loaded() {
    init_tracing();
    let stars = reorder(&star_list(30, 0.2, 5));

    let report = solve_field_with_config(&stars, WIDTH, HEIGHT, &[], &SolveConfig::default());
    assert_eq!(report.status, SolveStatus::NoIndexLoaded);
    assert_eq!(report.checkpoints_attempted, 0);
    assert_eq!(report.error(), Some(MatchError::NoIndexLoaded));

    // an index without quads is as good as none
    let empty: IndexHandle = Arc::new(QuadIndex::build(&[], &index_config()));
    let report = solve_field_with_config(&stars, WIDTH, HEIGHT, &[empty], &SolveConfig::default());
    assert_eq!(report.status, SolveStatus::NoIndexLoaded);
}

#[test]
fn test_threshold_equality_is_accepted() {
    init_tracing();
    let stars = reorder(&star_list(20, 0.2, 13));
    let mut config = SolveConfig {
        log_odds_threshold: f64::INFINITY,
        ..Default::default()
    };
    let baseline = solve_field_with_config(&stars, WIDTH, HEIGHT, &[shared_handle()], &config);
    assert_eq!(baseline.status, SolveStatus::Exhausted);
    let best = baseline.best_log_odds.expect("no candidate verified");

    config.log_odds_threshold = best;
    let report = solve_field_with_config(&stars, WIDTH, HEIGHT, &[shared_handle()], &config);
    assert_eq!(report.status, SolveStatus::Solved);
    assert_eq!(report.wcs.log_odds, best);
    assert!(report.quads_tried <= baseline.quads_tried);
}

#[test]
fn test_cancel_and_timeout_stop_before_searching() {
    init_tracing();
    let stars = reorder(&star_list(30, 0.2, 5));

    let cancelled = SolveConfig {
        cancel: Some(Arc::new(AtomicBool::new(true))),
        ..Default::default()
    };
    let report = solve_field_with_config(&stars, WIDTH, HEIGHT, &[shared_handle()], &cancelled);
    assert_eq!(report.status, SolveStatus::Cancelled);
    assert_eq!(report.checkpoints_attempted, 0);
    assert_eq!(report.error(), Some(MatchError::Exhausted { checkpoints: 0 }));

    let timed_out = SolveConfig {
        timeout_ms: Some(0),
        ..Default::default()
    };
    let report = solve_field_with_config(&stars, WIDTH, HEIGHT, &[shared_handle()], &timed_out);
    assert_eq!(report.status, SolveStatus::Timeout);
    assert!(!report.wcs.solved);
}

#[test]
fn test_saved_index_loads_and_solves() {
    init_tracing();
    let dir = std::env::temp_dir().join(format!("quadsolve_solve_test_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("index.rkyv");
    shared_index().save_to_file(&path).unwrap();

    let missing = dir.join("missing.rkyv");
    let indices = load_indices(&[path.clone(), missing]);
    assert_eq!(indices.len(), 1);
    assert_eq!(indices[0].num_quads(), shared_index().quads.len());

    let ordered = reorder(&star_list(60, 0.2, 7));
    let wcs = solve_field(&ordered, WIDTH, HEIGHT, &indices, 10.0, 180.0, 20.0);
    std::fs::remove_dir_all(&dir).ok();
    assert_matches_truth(&wcs);
}

#[test]
fn test_index_from_csv_matches_direct_build() {
    init_tracing();
    let path = std::env::temp_dir().join(format!("quadsolve_sky_{}.csv", std::process::id()));
    write_star_csv(&path, &sky_stars()).unwrap();
    let from_csv = QuadIndex::build_from_csv(&path, &index_config()).unwrap();
    std::fs::remove_file(&path).ok();

    let direct = shared_index();
    assert_eq!(from_csv.props, direct.props);
    assert_eq!(from_csv.quads, direct.quads);
}

#[test]
fn test_detections_outside_quads_do_not_break_solve() {
    init_tracing();
    // pad the real detections with hot pixels along one edge
    let mut stars = star_list(50, 0.2, 17).into_vec();
    for i in 0..10 {
        stars.push(DetectedStar::new(3.0, 20.0 + 45.0 * i as f32, 400.0, BACKGROUND));
    }
    let ordered = reorder(&StarList::new(stars));
    let report = solve_field_with_config(&ordered, WIDTH, HEIGHT, &[shared_handle()], &SolveConfig::default());
    assert_eq!(report.status, SolveStatus::Solved);
    assert_matches_truth(&report.wcs);
}

/// Solve the reference frame near RA 81.37, Dec -0.99. Needs
/// `QUADSOLVE_TEST_IMAGE` and `QUADSOLVE_TEST_INDEX` pointing at that image
/// and an index covering its field.
#[cfg(feature = "image")]
#[test]
#[ignore]
fn test_solve_reference_image() {
    init_tracing();
    let image_path = std::env::var("QUADSOLVE_TEST_IMAGE").expect("QUADSOLVE_TEST_IMAGE not set");
    let index_path = std::env::var("QUADSOLVE_TEST_INDEX").expect("QUADSOLVE_TEST_INDEX not set");

    let (width, height) = image::image_dimensions(&image_path).unwrap();
    let detected = quadsolve::detect_stars_in_file(&image_path, &DetectionConfig::default()).unwrap();
    let indices = load_indices(&[index_path]);
    assert_eq!(indices.len(), 1);

    let report = solve_field_with_config(
        &reorder(&detected.stars),
        width,
        height,
        &indices,
        &SolveConfig::default(),
    );
    println!(
        "{} detections, status {:?}, RA {:.4} Dec {:.4}, {:.2}\"/px, rotation {:.2}, {:.1} ms",
        detected.stars.len(),
        report.status,
        report.wcs.ra,
        report.wcs.dec,
        report.wcs.pixel_scale,
        report.wcs.rotation_deg,
        report.solve_time_ms
    );
    let n = detected.stars.len();
    assert!((627..=727).contains(&n), "{n} detections");
    assert!(report.is_solved());

    let (ra, dec) = report
        .wcs
        .pixel_to_radec(width as f64 / 2.0, height as f64 / 2.0)
        .unwrap();
    let center_err = angular_separation_deg(ra, dec, 81.37, dec);
    assert!(center_err < 0.5, "RA {ra:.4} is {center_err:.3} deg off");
    assert!((dec - -0.99).abs() < 0.5, "Dec {dec:.4}");

    let depth = report.accepted_depth.unwrap();
    assert!((21..=30).contains(&depth), "accepted at depth {depth}");
}
