use j2kcore_rs::dwt::{Dwt53, Dwt97};
use std::time::Instant;

fn main() {
    println!("Benchmarking wavelet transforms...");

    const W: i32 = 512;
    const H: i32 = 512;
    const NUM_RES: u32 = 6;

    // Deterministic ramp-plus-texture input
    let mut original = vec![0i32; (W * H) as usize];
    for y in 0..H {
        for x in 0..W {
            original[(y * W + x) as usize] = (x * 3 + y * 7) % 255 - 127;
        }
    }
    let original97: Vec<f32> = original.iter().map(|&v| v as f32).collect();

    let iterations = 100;

    // Benchmark 5/3 reversible
    let mut data53 = original.clone();
    let start = Instant::now();
    for _ in 0..iterations {
        Dwt53::forward(&mut data53, 0, 0, W, H, NUM_RES);
        Dwt53::inverse(&mut data53, 0, 0, W, H, NUM_RES, NUM_RES);
        // prevent optimization
        std::hint::black_box(&data53);
    }
    let duration53 = start.elapsed();
    println!(
        "5/3 reversible:   {:?} for {} round trips",
        duration53, iterations
    );

    // Benchmark 9/7 irreversible
    let mut data97 = original97.clone();
    let start = Instant::now();
    for _ in 0..iterations {
        Dwt97::forward(&mut data97, 0, 0, W, H, NUM_RES);
        Dwt97::inverse(&mut data97, 0, 0, W, H, NUM_RES, NUM_RES);
        // prevent optimization
        std::hint::black_box(&data97);
    }
    let duration97 = start.elapsed();
    println!(
        "9/7 irreversible: {:?} for {} round trips",
        duration97, iterations
    );

    let ratio = duration97.as_secs_f64() / duration53.as_secs_f64();
    println!("9/7 vs 5/3 time ratio: {:.2}x", ratio);

    // Verify accuracy on a single fresh round trip
    let mut check53 = original.clone();
    Dwt53::forward(&mut check53, 0, 0, W, H, NUM_RES);
    Dwt53::inverse(&mut check53, 0, 0, W, H, NUM_RES, NUM_RES);
    println!(
        "5/3 reconstruction: {}",
        if check53 == original {
            "exact (PASSED)"
        } else {
            "NOT exact (FAILED)"
        }
    );

    let mut check97 = original97.clone();
    Dwt97::forward(&mut check97, 0, 0, W, H, NUM_RES);
    Dwt97::inverse(&mut check97, 0, 0, W, H, NUM_RES, NUM_RES);
    let mut max_err = 0.0f32;
    for (a, b) in check97.iter().zip(&original97) {
        max_err = max_err.max((a - b).abs());
    }
    println!("9/7 max reconstruction error: {:.6}", max_err);
    if max_err < 0.01 {
        println!("Accuracy: PASSED (tolerance < 0.01)");
    } else {
        println!("Accuracy: FAILED (tolerance > 0.01)");
    }
}
