//! Backend parity tests for MsDeformAttnOps.

use super::helpers::*;
use deformr::ops::{
    MsDeformAttnOps, SpatialShapes, multi_scale_deformable_attn_reference,
    multi_scale_deformable_attn_reference_backward,
};
use numr::runtime::cpu::CpuRuntime;
use numr::tensor::Tensor;

struct Case {
    shapes: SpatialShapes,
    value: Tensor<CpuRuntime>,
    locations: Tensor<CpuRuntime>,
    weights: Tensor<CpuRuntime>,
    grad_output: Tensor<CpuRuntime>,
}

/// `(n, m, d, q, p)` over two levels; locations overhang the border slightly.
fn case(n: usize, m: usize, d: usize, q: usize, p: usize) -> Case {
    let (_, device) = setup_cpu();
    let shapes = SpatialShapes::new(&[(8, 6), (4, 3)]).unwrap();
    let s = shapes.total_positions();
    let l = shapes.num_levels();
    Case {
        value: det_tensor_in(&[n, s, m, d], -0.5, 0.5, &device),
        locations: det_tensor_in(&[n, q, m, l, p, 2], -0.1, 1.1, &device),
        weights: det_tensor_in(&[n, q, m, l, p], 0.0, 0.25, &device),
        grad_output: det_tensor_in(&[n, q, m * d], -1.0, 1.0, &device),
        shapes,
    }
}

#[test]
fn test_ms_deform_attn_fwd_parity() {
    let (cpu_client, _cpu_device) = setup_cpu();
    let c = case(2, 4, 16, 10, 4);
    let lsi = c.shapes.level_start_index();

    let cpu_out = cpu_client
        .ms_deform_attn_fwd(&c.value, &c.shapes, &lsi, &c.locations, &c.weights, 64)
        .unwrap();
    let cpu_out_vec = cpu_out.to_vec::<f32>();
    assert_eq!(cpu_out.shape(), &[2, 10, 64]);

    let reference = multi_scale_deformable_attn_reference(
        &cpu_client,
        &c.value,
        &c.shapes,
        &c.locations,
        &c.weights,
    )
    .unwrap();
    assert_parity_f32(&cpu_out_vec, &reference.to_vec::<f32>(), "ms_deform_attn_fwd CPU vs reference");

    #[cfg(feature = "cuda")]
    with_cuda_backend(|cuda_client, cuda_device| {
        use numr::runtime::cuda::CudaRuntime;
        let to_cuda = |t: &Tensor<CpuRuntime>| {
            Tensor::<CudaRuntime>::from_slice(&t.to_vec::<f32>(), t.shape(), &cuda_device)
        };
        let result = cuda_client
            .ms_deform_attn_fwd(
                &to_cuda(&c.value),
                &c.shapes,
                &lsi,
                &to_cuda(&c.locations),
                &to_cuda(&c.weights),
                64,
            )
            .unwrap();
        assert_parity_f32(&result.to_vec::<f32>(), &cpu_out_vec, "ms_deform_attn_fwd CUDA vs CPU");
    });

    #[cfg(feature = "wgpu")]
    with_wgpu_backend(|wgpu_client, wgpu_device| {
        use numr::runtime::wgpu::WgpuRuntime;
        let to_wgpu = |t: &Tensor<CpuRuntime>| {
            Tensor::<WgpuRuntime>::from_slice(&t.to_vec::<f32>(), t.shape(), &wgpu_device)
        };
        let result = wgpu_client
            .ms_deform_attn_fwd(
                &to_wgpu(&c.value),
                &c.shapes,
                &lsi,
                &to_wgpu(&c.locations),
                &to_wgpu(&c.weights),
                64,
            )
            .unwrap();
        assert_parity_f32(&result.to_vec::<f32>(), &cpu_out_vec, "ms_deform_attn_fwd WebGPU vs CPU");
    });
}

#[test]
fn test_ms_deform_attn_bwd_parity() {
    let (cpu_client, _cpu_device) = setup_cpu();
    let c = case(2, 2, 8, 6, 3);
    let lsi = c.shapes.level_start_index();

    let (gv, gl, gw) = cpu_client
        .ms_deform_attn_bwd(&c.grad_output, &c.value, &c.shapes, &lsi, &c.locations, &c.weights, 1)
        .unwrap();
    let (rv, rl, rw) = multi_scale_deformable_attn_reference_backward(
        &cpu_client,
        &c.grad_output,
        &c.value,
        &c.shapes,
        &c.locations,
        &c.weights,
    )
    .unwrap();

    let cpu_grads = [gv.to_vec::<f32>(), gl.to_vec::<f32>(), gw.to_vec::<f32>()];
    for (name, got, expected) in [
        ("grad_value", &cpu_grads[0], rv.to_vec::<f32>()),
        ("grad_sampling_locations", &cpu_grads[1], rl.to_vec::<f32>()),
        ("grad_attention_weights", &cpu_grads[2], rw.to_vec::<f32>()),
    ] {
        assert_parity_f32_tol(got, &expected, name, 1e-4, 1e-5);
    }

    #[cfg(feature = "cuda")]
    with_cuda_backend(|cuda_client, cuda_device| {
        use numr::runtime::cuda::CudaRuntime;
        let to_cuda = |t: &Tensor<CpuRuntime>| {
            Tensor::<CudaRuntime>::from_slice(&t.to_vec::<f32>(), t.shape(), &cuda_device)
        };
        let (v, l, w) = cuda_client
            .ms_deform_attn_bwd(
                &to_cuda(&c.grad_output),
                &to_cuda(&c.value),
                &c.shapes,
                &lsi,
                &to_cuda(&c.locations),
                &to_cuda(&c.weights),
                1,
            )
            .unwrap();
        for (got, expected) in [v, l, w].iter().zip(&cpu_grads) {
            assert_parity_f32_tol(&got.to_vec::<f32>(), expected, "ms_deform_attn_bwd CUDA vs CPU", 1e-4, 1e-5);
        }
    });

    #[cfg(feature = "wgpu")]
    with_wgpu_backend(|wgpu_client, wgpu_device| {
        use numr::runtime::wgpu::WgpuRuntime;
        let to_wgpu = |t: &Tensor<CpuRuntime>| {
            Tensor::<WgpuRuntime>::from_slice(&t.to_vec::<f32>(), t.shape(), &wgpu_device)
        };
        let (v, l, w) = wgpu_client
            .ms_deform_attn_bwd(
                &to_wgpu(&c.grad_output),
                &to_wgpu(&c.value),
                &c.shapes,
                &lsi,
                &to_wgpu(&c.locations),
                &to_wgpu(&c.weights),
                1,
            )
            .unwrap();
        for (got, expected) in [v, l, w].iter().zip(&cpu_grads) {
            assert_parity_f32_tol(&got.to_vec::<f32>(), expected, "ms_deform_attn_bwd WebGPU vs CPU", 1e-4, 1e-5);
        }
    });
}

#[test]
fn test_ms_deform_attn_im2col_parity() {
    let (cpu_client, _cpu_device) = setup_cpu();
    let c = case(4, 2, 4, 5, 2);
    let lsi = c.shapes.level_start_index();

    let whole = cpu_client
        .ms_deform_attn_fwd(&c.value, &c.shapes, &lsi, &c.locations, &c.weights, 64)
        .unwrap()
        .to_vec::<f32>();
    for step in [1, 2, 4] {
        let chunked = cpu_client
            .ms_deform_attn_fwd(&c.value, &c.shapes, &lsi, &c.locations, &c.weights, step)
            .unwrap()
            .to_vec::<f32>();
        assert_eq!(chunked, whole, "im2col_step {step}");
    }
}
