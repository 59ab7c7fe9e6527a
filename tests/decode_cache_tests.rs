use std::fs;

use anyhow::Result;
use candle_core::{Device, Tensor};
use qdecode::{
    load_pipeline, CacheHandle, CacheStats, LookupTable, Module, QuantLinear, TaggedBatch,
    TensorStore,
};

fn embeddings() -> Result<Tensor> {
    let data: Vec<f32> = (0..16 * 8).map(|i| ((i * 5 % 17) as f32 - 8.0) * 0.04).collect();
    Ok(Tensor::from_vec(data, (16, 8), &Device::Cpu)?)
}

fn generator() -> Result<(Tensor, Tensor)> {
    let weight: Vec<f32> = (0..16 * 8).map(|i| ((i * 11 % 19) as f32 - 9.0) * 0.025).collect();
    let bias: Vec<f32> = (0..16).map(|i| (i % 4) as f32 * 0.1).collect();
    Ok((
        Tensor::from_vec(weight, (16, 8), &Device::Cpu)?,
        Tensor::from_vec(bias, 16, &Device::Cpu)?,
    ))
}

fn ids(values: &[u32]) -> Result<TaggedBatch> {
    Ok(TaggedBatch::new(Tensor::from_slice(values, values.len(), &Device::Cpu)?))
}

#[test]
fn repeated_ids_are_served_from_the_projection_cache() -> Result<()> {
    let cache = CacheHandle::new(4);
    let (weight, bias) = generator()?;
    let mut lookup = LookupTable::new(embeddings()?, cache.clone())?;
    let mut projection = QuantLinear::from_parameters(weight.clone(), Some(bias.clone()), cache)?;

    let plain_cache = CacheHandle::disabled();
    let mut plain_lookup = LookupTable::new(embeddings()?, plain_cache.clone())?;
    let mut plain_projection = QuantLinear::from_parameters(weight, Some(bias), plain_cache)?;

    let step = |lookup: &mut LookupTable, projection: &mut QuantLinear, values: &[u32]| -> Result<Vec<Vec<f32>>> {
        let hidden = lookup.forward(ids(values)?)?;
        Ok(projection.forward(hidden)?.data().to_vec2::<f32>()?)
    };

    let first = step(&mut lookup, &mut projection, &[1, 2, 1])?;
    assert_eq!(
        projection.stats(),
        CacheStats { hits: 0, repeats: 1, misses: 2, computed: 2 }
    );
    assert_eq!(first[2], first[0]);
    assert_eq!(first, step(&mut plain_lookup, &mut plain_projection, &[1, 2, 1])?);

    let second = step(&mut lookup, &mut projection, &[1, 3])?;
    assert_eq!(
        projection.stats(),
        CacheStats { hits: 1, repeats: 1, misses: 3, computed: 3 }
    );
    assert_eq!(second[0], first[0]);
    assert_eq!(second, step(&mut plain_lookup, &mut plain_projection, &[1, 3])?);
    Ok(())
}

#[test]
fn pipeline_loads_from_a_config_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (weight, bias) = generator()?;
    let mut store = TensorStore::default();
    store.insert("src_emb.weight", embeddings()?);
    store.insert("generator.weight", weight);
    store.insert("generator.bias", bias);
    store.save(dir.path().join("model.safetensors"))?;

    let config = dir.path().join("decode.toml");
    fs::write(
        &config,
        r#"
weights = "model.safetensors"
cache_capacity = 4

[[layers]]
type = "lookup_table"
prefix = "src_emb"

[[layers]]
type = "quant_sigmoid"

[[layers]]
type = "quant_linear"
prefix = "generator"
"#,
    )?;

    let mut pipeline = load_pipeline(&config)?;
    assert_eq!(pipeline.cache().capacity(), 4);

    let input = Tensor::from_slice(&[1u32, 2, 1], 3, &Device::Cpu)?;
    let first = pipeline.forward(&input)?.to_vec2::<f32>()?;
    assert_eq!(first.len(), 3);
    assert_eq!(first[0].len(), 16);
    assert_eq!(first[2], first[0]);

    let input = Tensor::from_slice(&[3u32, 1], 2, &Device::Cpu)?;
    let second = pipeline.forward(&input)?.to_vec2::<f32>()?;
    assert_eq!(second[1], first[0]);
    Ok(())
}

#[test]
fn missing_config_reports_the_path() {
    let err = match load_pipeline("/nonexistent/decode.toml") {
        Err(err) => err,
        Ok(_) => panic!("loaded a pipeline from a missing file"),
    };
    assert!(format!("{:#}", err).contains("/nonexistent/decode.toml"));
}
