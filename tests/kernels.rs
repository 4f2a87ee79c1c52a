use std::error::Error;

use braid::{
    Connector, Context, Tensor,
    blocks::{Block, Embedding},
    loom::{device::CpuBuilder, ops::Axis},
};

#[test]
fn test_scatter_duplicate_rows() -> Result<(), Box<dyn Error>> {
    let cpu = CpuBuilder::new().build()?;
    let context = Context::new(&cpu)?;

    let initial: Vec<f32> = (0..20).map(|x| x as f32).collect();
    let table = Tensor::from_host(&context, (5, 4), initial.clone())?;
    let dense: Vec<f32> = vec![
        1.0, 2.0, 3.0, 4.0, //
        10.0, 20.0, 30.0, 40.0, //
        0.5, 0.5, 0.5, 0.5,
    ];
    let dense = Tensor::from_host(&context, (3, 4), dense)?;
    table.sliced_inplace_add(&context, Axis::Rows, 1.0, &dense, &[1, 1, 2])?;

    let output = table.to_host(&context).wait()?;
    let row = |r: usize| &output[r * 4..(r + 1) * 4];
    assert_eq!(row(0), &initial[0..4]);
    assert_eq!(row(1), &[15.0, 27.0, 39.0, 51.0]);
    assert_eq!(row(2), &[8.5, 9.5, 10.5, 11.5]);
    assert_eq!(row(3), &initial[12..16]);
    assert_eq!(row(4), &initial[16..20]);
    Ok(())
}

#[test]
fn test_embedding_backward() -> Result<(), Box<dyn Error>> {
    let cpu = CpuBuilder::new().build()?;
    let context = Context::new(&cpu)?;

    // a (vocabulary 3, features 2) table read by a batch of 3
    let table = Tensor::from_host(&context, (3, 2), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
    let mut embedding = Embedding::new(context.clone(), table, 3)?;
    embedding.set_indices(&[2, 0, 2])?;
    assert!(embedding.set_indices(&[0]).is_err());

    let consumer = Context::new(&cpu)?;
    let usage = embedding
        .output()
        .register_usage(consumer.clone(), consumer.clone())?;

    embedding.fprop()?;
    let value = Tensor::zeros(&cpu, (2, 3));
    value.assign_copy(&consumer, usage.value())?;
    assert_eq!(value.to_host(&consumer).wait()?, vec![5.0, 1.0, 5.0, 6.0, 2.0, 6.0]);

    // gradient of one per feature and sample, scaled by the sample position
    let gradient = vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0];
    usage.gradient().assign_host(&consumer, gradient)?;
    usage.bprop()?;
    embedding.bprop()?;

    let table_gradient = embedding.table_gradient().to_host(&context).wait()?;
    assert_eq!(table_gradient, vec![2.0, 2.0, 0.0, 0.0, 4.0, 4.0]);
    Ok(())
}

#[test]
fn test_host_callback_metric() -> Result<(), Box<dyn Error>> {
    let cpu = CpuBuilder::new().build()?;
    let context = Context::new(&cpu)?;

    let logits = Tensor::from_host(&context, (1, 4), vec![2.0, -1.0, 0.5, -3.0])?;
    let probs = Tensor::zeros(&cpu, (1, 4));
    probs.assign_sigmoid(&context, &logits, None)?;
    let labels = [1.0, 0.0, 0.0, 0.0];

    // the download lands before the callback runs, so waiting on it there never blocks
    let (sender, receiver) = flume::unbounded();
    let download = probs.to_host(&context);
    context.add_callback(move || {
        let Ok(probs) = download.wait() else {
            return;
        };
        let hits = probs
            .iter()
            .zip(labels)
            .filter(|&(&p, y)| (p >= 0.5) == (y >= 0.5))
            .count();
        _ = sender.send(hits as f32 / labels.len() as f32);
    });

    context.synchronize()?;
    assert_eq!(receiver.try_recv()?, 0.75);
    Ok(())
}

#[test]
fn test_connector_on_shared_stream() -> Result<(), Box<dyn Error>> {
    let cpu = CpuBuilder::new().build()?;
    let context = Context::new(&cpu)?;

    // producer and consumers on one stream need no events at all
    let connector = Connector::builder(Tensor::zeros(&cpu, (2, 2)))
        .forward_context(context.clone())
        .build()?;
    let a = connector.register_usage(context.clone(), context.clone())?;
    let b = connector.register_usage(context.clone(), context.clone())?;

    connector.value().fill(&context, 1.0)?;
    connector.fprop()?;
    a.gradient().assign_scale(&context, 2.0, a.value())?;
    b.gradient().assign_scale(&context, -0.5, b.value())?;
    b.bprop()?;
    a.bprop()?;

    let gradient = connector.bprop()?;
    assert_eq!(gradient.to_host(&context).wait()?, vec![1.5; 4]);
    Ok(())
}
