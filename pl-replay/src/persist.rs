//! Save and restore replay buffers as one safetensors file plus a meta JSON.
//!
//! Both files are written to a `.tmp` sibling and renamed into place, so a
//! crash mid-write leaves the previous pair intact.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytemuck::cast_slice;
use pl_core::{Observation, Transition};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};

use crate::buffer::{ReplayBuffer, SplitBuffers};
use crate::schema::{
    FORMAT_VERSION, TEST_STEM, TRAIN_STEM, T_ACTIONS, T_FEATURES, T_GAMMAS, T_GREEDY_PATH,
    T_HAS_NEXT, T_NEXT_FEATURES, T_NEXT_PIXELS, T_N_STEPS, T_PIXELS, T_RETURNS,
};
use crate::ReplayError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayMeta {
    pub format_version: u32,
    pub num_samples: usize,
    pub feature_len: usize,
    pub pixel_len: usize,
    pub capacity: usize,
    pub total_pushed: u64,
}

fn st_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.safetensors"))
}

fn meta_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.meta.json"))
}

fn write_atomic(path: &Path, tmp_ext: &str, bytes: &[u8]) -> Result<(), ReplayError> {
    let tmp = path.with_extension(tmp_ext);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Write `buf` (oldest first) under `dir/<stem>.*`.
pub fn save_buffer(buf: &ReplayBuffer, dir: &Path, stem: &str) -> Result<ReplayMeta, ReplayError> {
    fs::create_dir_all(dir)?;
    let n = buf.len();
    let (feature_len, pixel_len) = match buf.iter().next() {
        Some(t) => (t.state.features.len(), t.state.pixels.len()),
        None => (0, 0),
    };

    let mut features = Vec::<f32>::with_capacity(n * feature_len);
    let mut pixels = Vec::<u8>::with_capacity(n * pixel_len);
    let mut next_features = Vec::<f32>::with_capacity(n * feature_len);
    let mut next_pixels = Vec::<u8>::with_capacity(n * pixel_len);
    let mut actions = Vec::<u8>::with_capacity(n);
    let mut returns = Vec::<f32>::with_capacity(n);
    let mut n_steps = Vec::<u8>::with_capacity(n);
    let mut gammas = Vec::<f32>::with_capacity(n);
    let mut has_next = Vec::<u8>::with_capacity(n);
    let mut greedy = Vec::<u8>::with_capacity(n);

    for (i, t) in buf.iter().enumerate() {
        check_obs(&t.state, feature_len, pixel_len, i)?;
        features.extend_from_slice(&t.state.features);
        pixels.extend_from_slice(&t.state.pixels);
        match &t.next_state {
            Some(next) => {
                check_obs(next, feature_len, pixel_len, i)?;
                next_features.extend_from_slice(&next.features);
                next_pixels.extend_from_slice(&next.pixels);
                has_next.push(1);
            }
            None => {
                next_features.resize(next_features.len() + feature_len, 0.0);
                next_pixels.resize(next_pixels.len() + pixel_len, 0);
                has_next.push(0);
            }
        }
        actions.push(t.action);
        returns.push(t.n_step_return);
        n_steps.push(t.n);
        gammas.push(t.gamma);
        greedy.push(t.greedy_path as u8);
    }

    let meta = ReplayMeta {
        format_version: FORMAT_VERSION,
        num_samples: n,
        feature_len,
        pixel_len,
        capacity: buf.capacity(),
        total_pushed: buf.total_pushed(),
    };

    let st = st_path(dir, stem);
    if n > 0 {
        let mut tensors: BTreeMap<String, TensorView<'_>> = BTreeMap::new();
        tensors.insert(
            T_FEATURES.to_string(),
            TensorView::new(Dtype::F32, vec![n, feature_len], cast_slice(&features))?,
        );
        tensors.insert(
            T_PIXELS.to_string(),
            TensorView::new(Dtype::U8, vec![n, pixel_len], &pixels)?,
        );
        tensors.insert(
            T_NEXT_FEATURES.to_string(),
            TensorView::new(Dtype::F32, vec![n, feature_len], cast_slice(&next_features))?,
        );
        tensors.insert(
            T_NEXT_PIXELS.to_string(),
            TensorView::new(Dtype::U8, vec![n, pixel_len], &next_pixels)?,
        );
        tensors.insert(
            T_ACTIONS.to_string(),
            TensorView::new(Dtype::U8, vec![n], &actions)?,
        );
        tensors.insert(
            T_RETURNS.to_string(),
            TensorView::new(Dtype::F32, vec![n], cast_slice(&returns))?,
        );
        tensors.insert(
            T_N_STEPS.to_string(),
            TensorView::new(Dtype::U8, vec![n], &n_steps)?,
        );
        tensors.insert(
            T_GAMMAS.to_string(),
            TensorView::new(Dtype::F32, vec![n], cast_slice(&gammas))?,
        );
        tensors.insert(
            T_HAS_NEXT.to_string(),
            TensorView::new(Dtype::U8, vec![n], &has_next)?,
        );
        tensors.insert(
            T_GREEDY_PATH.to_string(),
            TensorView::new(Dtype::U8, vec![n], &greedy)?,
        );
        let bytes = safetensors::serialize(&tensors, &None)?;
        write_atomic(&st, "safetensors.tmp", &bytes)?;
    } else if st.exists() {
        // Empty buffer: meta alone describes it; a stale tensor file would be misread.
        fs::remove_file(&st)?;
    }
    write_atomic(
        &meta_path(dir, stem),
        "meta.json.tmp",
        &serde_json::to_vec_pretty(&meta)?,
    )?;
    Ok(meta)
}

fn check_obs(o: &Observation, fl: usize, pl: usize, i: usize) -> Result<(), ReplayError> {
    if o.features.len() != fl || o.pixels.len() != pl {
        return Err(ReplayError::Shape(format!(
            "sample {i}: observation is {}+{}, buffer uses {fl}+{pl}",
            o.features.len(),
            o.pixels.len()
        )));
    }
    Ok(())
}

fn tensor_bytes<'a>(
    st: &'a SafeTensors<'a>,
    name: &str,
    dtype: Dtype,
    shape: &[usize],
) -> Result<&'a [u8], ReplayError> {
    let t = st.tensor(name)?;
    if t.dtype() != dtype || t.shape() != shape {
        return Err(ReplayError::Shape(format!(
            "{name}: got {:?} {:?}, want {dtype:?} {shape:?}",
            t.dtype(),
            t.shape()
        )));
    }
    Ok(t.data())
}

fn f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Restore a buffer written by [`save_buffer`]. A missing meta file yields an
/// empty buffer. When the file holds more samples than `capacity`, the most
/// recent ones are kept.
pub fn load_buffer(dir: &Path, stem: &str, capacity: usize) -> Result<ReplayBuffer, ReplayError> {
    let mut buf = ReplayBuffer::new(capacity)?;
    let meta_p = meta_path(dir, stem);
    if !meta_p.exists() {
        return Ok(buf);
    }
    let meta: ReplayMeta = serde_json::from_slice(&fs::read(&meta_p)?)?;
    if meta.format_version != FORMAT_VERSION {
        return Err(ReplayError::Shape(format!(
            "format version {} (expected {FORMAT_VERSION})",
            meta.format_version
        )));
    }
    let n = meta.num_samples;
    if n == 0 {
        return Ok(buf);
    }
    let (fl, pl) = (meta.feature_len, meta.pixel_len);

    let bytes = fs::read(st_path(dir, stem))?;
    let st = SafeTensors::deserialize(&bytes)?;
    let features = f32s(tensor_bytes(&st, T_FEATURES, Dtype::F32, &[n, fl])?);
    let pixels = tensor_bytes(&st, T_PIXELS, Dtype::U8, &[n, pl])?;
    let next_features = f32s(tensor_bytes(&st, T_NEXT_FEATURES, Dtype::F32, &[n, fl])?);
    let next_pixels = tensor_bytes(&st, T_NEXT_PIXELS, Dtype::U8, &[n, pl])?;
    let actions = tensor_bytes(&st, T_ACTIONS, Dtype::U8, &[n])?;
    let returns = f32s(tensor_bytes(&st, T_RETURNS, Dtype::F32, &[n])?);
    let n_steps = tensor_bytes(&st, T_N_STEPS, Dtype::U8, &[n])?;
    let gammas = f32s(tensor_bytes(&st, T_GAMMAS, Dtype::F32, &[n])?);
    let has_next = tensor_bytes(&st, T_HAS_NEXT, Dtype::U8, &[n])?;
    let greedy = tensor_bytes(&st, T_GREEDY_PATH, Dtype::U8, &[n])?;

    for i in n.saturating_sub(capacity)..n {
        let state = Observation::new(
            pixels[i * pl..(i + 1) * pl].to_vec(),
            features[i * fl..(i + 1) * fl].to_vec(),
        );
        let next_state = (has_next[i] != 0).then(|| {
            Arc::new(Observation::new(
                next_pixels[i * pl..(i + 1) * pl].to_vec(),
                next_features[i * fl..(i + 1) * fl].to_vec(),
            ))
        });
        buf.push(Transition {
            state: Arc::new(state),
            action: actions[i],
            n_step_return: returns[i],
            next_state,
            n: n_steps[i],
            gamma: gammas[i],
            bootstrap_discount: gammas[i].powi(n_steps[i] as i32),
            greedy_path: greedy[i] != 0,
        });
    }
    Ok(buf)
}

/// Persist both halves of a split under `dir`.
pub fn save_split(buffers: &SplitBuffers, dir: &Path) -> Result<(ReplayMeta, ReplayMeta), ReplayError> {
    let train = save_buffer(&buffers.train, dir, TRAIN_STEM)?;
    let test = save_buffer(&buffers.test, dir, TEST_STEM)?;
    Ok((train, test))
}

pub fn load_split(
    dir: &Path,
    train_capacity: usize,
    test_capacity: usize,
) -> Result<SplitBuffers, ReplayError> {
    Ok(SplitBuffers {
        train: load_buffer(dir, TRAIN_STEM, train_capacity)?,
        test: load_buffer(dir, TEST_STEM, test_capacity)?,
    })
}

/// Remove `.tmp` leftovers from an interrupted save.
pub fn cleanup_tmp_files(dir: &Path) -> Result<(), ReplayError> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let p = entry?.path();
        if let Some(name) = p.file_name().and_then(|s| s.to_str()) {
            if name.ends_with(".safetensors.tmp") || name.ends_with(".meta.json.tmp") {
                let _ = fs::remove_file(&p);
            }
        }
    }
    Ok(())
}
