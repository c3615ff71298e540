use super::*;
use candle_core::{DType, Device};

fn small_pair(patch: usize) -> Result<ModelPair> {
    ModelPair::reference(
        GeneratorConfig {
            channels: 1,
            ngf: 4,
            nglf: 4,
            num_modules: 6,
        },
        DiscriminatorConfig { channels: 1, ndf: 4 },
        patch,
        &Device::Cpu,
    )
}

fn all_finite(t: &Tensor) -> bool {
    t.flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
        .iter()
        .all(|v| v.is_finite())
}

#[test]
fn test_fresh_forward_is_finite_and_shaped() {
    let pair = small_pair(32).unwrap();
    let x = Tensor::randn(0f32, 0.5, (2, 1, 32, 32), &Device::Cpu).unwrap();
    let y = Tensor::randn(0f32, 0.5, (2, 1, 32, 32), &Device::Cpu).unwrap();

    let out = pair.forward(&x, &y, true).unwrap();

    for t in [&out.g_x, &out.f_gx, &out.f_y, &out.g_fy, &out.g_y, &out.f_x] {
        assert_eq!(t.dims(), &[2, 1, 32, 32]);
        assert!(all_finite(t));
    }
    for t in [&out.d_gx, &out.d_fy, &out.d_y, &out.d_x] {
        assert_eq!(t.dims(), &[2, 1, 2, 2]);
        assert!(all_finite(t));
    }
}

#[test]
fn test_patch_too_small_is_configuration_error() {
    let err = small_pair(16).err().unwrap();
    assert!(err.is_configuration());
}

#[test]
fn test_mismatched_pair_shapes_rejected() {
    let pair = small_pair(32).unwrap();
    let x = Tensor::zeros((2, 1, 32, 32), DType::F32, &Device::Cpu).unwrap();
    let y = Tensor::zeros((1, 1, 32, 32), DType::F32, &Device::Cpu).unwrap();
    assert!(matches!(pair.forward(&x, &y, true), Err(Error::Shape { .. })));
}

#[test]
fn test_rank_three_input_rejected() {
    let pair = small_pair(32).unwrap();
    let x = Tensor::zeros((1, 32, 32), DType::F32, &Device::Cpu).unwrap();
    assert!(pair.forward(&x, &x, false).unwrap_err().is_configuration());
}

#[test]
fn test_role_mismatch_rejected() {
    let device = Device::Cpu;
    let gen = GeneratorConfig {
        channels: 1,
        ngf: 2,
        nglf: 2,
        num_modules: 1,
    };
    let disc = DiscriminatorConfig { channels: 1, ndf: 2 };

    let result = ModelPair::new(
        Box::new(PatchDiscriminator::new("swapped", disc.clone(), &device).unwrap()),
        Box::new(ResidualGenerator::new(GENERATOR_F, gen, &device).unwrap()),
        Box::new(PatchDiscriminator::new(DISCRIMINATOR_X, disc.clone(), &device).unwrap()),
        Box::new(PatchDiscriminator::new(DISCRIMINATOR_Y, disc, &device).unwrap()),
        1,
    );
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_detached_scores_do_not_reach_generators() {
    let pair = small_pair(32).unwrap();
    let x = Tensor::randn(0f32, 0.5, (1, 1, 32, 32), &Device::Cpu).unwrap();
    let y = Tensor::randn(0f32, 0.5, (1, 1, 32, 32), &Device::Cpu).unwrap();

    let out = pair.forward(&x, &y, true).unwrap();
    let fakes = pair.score_detached_fakes(&out, true).unwrap();
    let loss = (fakes.d_gx.sqr().unwrap().mean_all().unwrap()
        + fakes.d_fy.sqr().unwrap().mean_all().unwrap())
    .unwrap();
    let grads = loss.backward().unwrap();

    for var in pair.generator_g.varmap().all_vars() {
        assert!(grads.get(&var).is_none());
    }
    let disc_grads = pair
        .discriminator_y
        .varmap()
        .all_vars()
        .iter()
        .filter(|v| grads.get(v).is_some())
        .count();
    assert!(disc_grads > 0);
}

#[test]
fn test_networks_for_role() {
    let pair = small_pair(32).unwrap();
    let names: Vec<_> = pair
        .networks_for(NetworkRole::Discriminator)
        .iter()
        .map(|n| n.name().to_string())
        .collect();
    assert_eq!(names, vec![DISCRIMINATOR_X, DISCRIMINATOR_Y]);
}
