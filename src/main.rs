use anyhow::Result;
use nalgebra::{UnitQuaternion, Vector3};

use vslam_backend::loop_closing::LoopDetectorConfig;
use vslam_backend::map::Descriptor;
use vslam_backend::{BackendConfig, KeyframeInput, SlamBackend, SE3};

/// Number of keyframes on the synthetic loop.
const NUM_FRAMES: usize = 100;

/// Radius of the circular trajectory in meters.
const RADIUS: f64 = 5.0;

/// Per-frame odometry drift in meters.
const DRIFT_PER_FRAME: f64 = 0.005;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!(
        "Simulating a circular trajectory: {} keyframes, radius {} m, drift {} m/frame",
        NUM_FRAMES, RADIUS, DRIFT_PER_FRAME
    );

    let config = BackendConfig {
        loop_detection_enabled: true,
        optimization_frequency: 20,
        vocabulary: vocabulary(),
        detector: LoopDetectorConfig {
            similarity_threshold: 0.7,
            exclude_recent_frames: 60,
            temporal_consistency_window: 3,
            min_feature_matches: 10,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut backend: SlamBackend = SlamBackend::new(config);

    for i in 0..NUM_FRAMES {
        let input = synthetic_keyframe(i);
        let result = backend.add_keyframe(input)?;

        if result.loop_closure_detected {
            println!("Frame {}: loop closure accepted", i);
        }

        if i % 10 == 0 {
            let stats = backend.statistics();
            println!(
                "Frame {}/{}: {} keyframes, {} edges, {} loop closures",
                i, NUM_FRAMES, stats.num_keyframes, stats.num_edges, stats.num_loop_closures
            );
        }
    }

    let stats = backend.statistics();
    println!(
        "Done! {} frames processed, {} edges, {} loop closures",
        stats.frames_processed, stats.num_edges, stats.num_loop_closures
    );

    for lc in backend.loop_closures() {
        println!(
            "Loop: {} -> {} (confidence {:.3}, {} matches)",
            lc.query_frame_id,
            lc.match_frame_id,
            lc.confidence,
            lc.matches.len()
        );
    }

    let trajectory = backend.current_trajectory();
    if let (Some(first), Some(last)) = (trajectory.first(), trajectory.last()) {
        println!(
            "Start-to-end gap after optimization: {:.3} m",
            (last.translation - first.translation).norm()
        );
    }

    Ok(())
}

/// Eight visual words spread over the descriptor byte range.
fn vocabulary() -> Vec<Descriptor> {
    (0..8u8).map(|i| Descriptor::filled(i * 32)).collect()
}

/// One simulated keyframe on the drifting circle.
///
/// Appearance and local 3D structure depend only on the angular sector, so
/// the final frames look like the first ones and close the loop.
fn synthetic_keyframe(i: usize) -> KeyframeInput {
    let theta = 2.0 * std::f64::consts::PI * (i as f64) / (NUM_FRAMES as f64);

    // Odometry estimate: the true circle plus accumulated drift in x
    let drift = DRIFT_PER_FRAME * i as f64;
    let position = Vector3::new(RADIUS * theta.cos() + drift, RADIUS * theta.sin(), 0.0);
    let heading = UnitQuaternion::from_euler_angles(0.0, 0.0, theta);

    // Sector-dependent appearance: 20 descriptors per frame
    let sector = (i * 8 / NUM_FRAMES) as u8;
    let descriptors: Vec<Descriptor> = (0..20u8)
        .map(|f| Descriptor::filled(sector.wrapping_mul(32).wrapping_add(f)))
        .collect();

    // Sector-dependent local structure in camera frame
    let points_cam = (0..20)
        .map(|f| {
            Some(Vector3::new(
                (f % 5) as f64 + sector as f64 * 0.1,
                (f / 5) as f64,
                2.0 + (f % 3) as f64,
            ))
        })
        .collect();

    KeyframeInput {
        timestamp: i as f64 * 0.1,
        pose: SE3::new(heading, position),
        descriptors,
        points_cam,
        ..Default::default()
    }
}
