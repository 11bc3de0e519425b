use super::*;

fn patterned(rows: usize, cols: usize, seed: usize) -> Matrix {
    let data = (0..rows * cols).map(|i| (((i * 31 + seed * 7) % 19) as f32 - 9.0) * 0.05).collect();
    Matrix::from_flat(rows, cols, data).unwrap()
}

#[test]
fn test_small_products_stay_on_cpu() {
    let engine = MatrixEngine::new(ComputeContext::acquire());
    let a = patterned(10, 8, 1);
    let b = patterned(8, 10, 2);

    assert_eq!(engine.plan(&a, &b), Backend::Cpu);
}

#[test]
fn test_unavailable_device_falls_back_to_cpu() {
    let engine = MatrixEngine::cpu().with_gpu_threshold(0);
    let a = patterned(100, 16, 1);
    let b = patterned(16, 100, 2);

    assert_eq!(engine.plan(&a, &b), Backend::Cpu);
    assert_eq!(engine.multiply(&a, &b).unwrap(), cpu_matmul(&a, &b).unwrap());
}

#[test]
fn test_multiply_rejects_mismatched_shapes() {
    let engine = MatrixEngine::cpu();
    for (a_shape, b_shape) in [((3, 4), (5, 3)), ((1, 2), (1, 2)), ((80, 80), (81, 80))] {
        let a = Matrix::zeros(a_shape.0, a_shape.1);
        let b = Matrix::zeros(b_shape.0, b_shape.1);
        assert!(matches!(engine.multiply(&a, &b), Err(Error::DimensionMismatch { op: "multiply", .. })));
    }
}

#[test]
fn test_matmul_kernel_bakes_in_dimensions() {
    let source = MatmulKernel { cols_a: 768, cols_b: 2304 }.render(64);

    assert!(source.contains("@workgroup_size(64)"));
    assert!(source.contains("global_id.x / 2304u"));
    assert!(source.contains("i < 768u"));
    assert!(source.contains("input0[row * 768u + i] * input1[i * 2304u + col]"));
}

#[test]
fn test_gpu_and_cpu_paths_agree() {
    let engine = MatrixEngine::new(ComputeContext::acquire());
    if !engine.compute().is_gpu_available() {
        return;
    }

    for (m, k, n) in [(50, 64, 100), (7, 768, 600), (128, 33, 129)] {
        let a = patterned(m, k, m);
        let b = patterned(k, n, n);
        assert_eq!(engine.plan(&a, &b), Backend::Gpu);

        let gpu = engine.multiply(&a, &b).unwrap();
        let cpu = cpu_matmul(&a, &b).unwrap();

        assert_eq!(gpu.shape(), cpu.shape());
        for (g, c) in gpu.as_slice().iter().zip(cpu.as_slice()) {
            let tolerance = 1e-3 * c.abs().max(1.0);
            assert!((g - c).abs() <= tolerance, "gpu {g} vs cpu {c}");
        }
    }
}
