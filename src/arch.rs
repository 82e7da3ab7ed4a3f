//! Architecture descriptors for the generator and both discriminators.
//!
//! A descriptor is an ordered list of stages resolved once from the base
//! channel width, the target resolution and the attention/kernel/dilation
//! strings. It is never mutated after construction.

use std::collections::BTreeSet;

use crate::error::{Result, VganError};

pub const SUPPORTED_RESOLUTIONS: [usize; 5] = [32, 64, 128, 256, 512];

/// One stage of a model: a core block plus whatever sub-layers its flags enable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Upsample (generator) or downsample (discriminators) by 2.
    pub resample: bool,
    /// Spatial resolution at the output of this stage.
    pub resolution: usize,
    pub attention: bool,
    /// Volumetric (3D) block; only set in the video discriminator.
    pub volumetric: bool,
    pub kernel_size: usize,
    pub dilation: usize,
}

impl StageSpec {
    /// Same-size padding for this stage's convolutions.
    pub fn padding(&self) -> usize {
        self.dilation * (self.kernel_size - 1) / 2
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Architecture {
    resolution: usize,
    stages: Vec<StageSpec>,
}

impl Architecture {
    /// Resolution key this descriptor was resolved for.
    pub fn resolution(&self) -> usize {
        self.resolution
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn in_channels(&self) -> Vec<usize> {
        self.stages.iter().map(|s| s.in_channels).collect()
    }

    pub fn out_channels(&self) -> Vec<usize> {
        self.stages.iter().map(|s| s.out_channels).collect()
    }

    pub fn resolutions(&self) -> Vec<usize> {
        self.stages.iter().map(|s| s.resolution).collect()
    }

    /// Resolution declared by the last stage.
    pub fn output_resolution(&self) -> usize {
        self.stages.last().map(|s| s.resolution).unwrap_or(0)
    }

    pub fn num_resampling(&self) -> usize {
        self.stages.iter().filter(|s| s.resample).count()
    }

    pub fn num_volumetric(&self) -> usize {
        self.stages.iter().filter(|s| s.volumetric).count()
    }

    /// Resolutions with attention enabled, in stage order.
    pub fn attention_resolutions(&self) -> Vec<usize> {
        self.stages
            .iter()
            .filter(|s| s.attention)
            .map(|s| s.resolution)
            .collect()
    }
}

/// The string-valued knobs shared by every resolver.
#[derive(Debug, Clone, Copy)]
pub struct ArchSpec<'a> {
    pub ch: usize,
    pub attention: &'a str,
    pub kernel: &'a str,
    pub dilation: &'a str,
}

impl<'a> ArchSpec<'a> {
    pub fn new(ch: usize, attention: &'a str) -> Self {
        Self {
            ch,
            attention,
            kernel: "333333",
            dilation: "111111",
        }
    }
}

/// Parse an underscore-separated list of resolutions such as `"32_64"`.
///
/// An empty string enables attention nowhere.
pub fn parse_attention(spec: &str) -> Result<BTreeSet<usize>> {
    spec.split('_')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<usize>().map_err(|_| {
                VganError::config(format!("malformed attention spec '{spec}': '{item}' is not a number"))
            })
        })
        .collect()
}

/// One digit per stage; the last digit repeats when the string is short.
fn parse_digits(spec: &str, what: &str, stages: usize) -> Result<Vec<usize>> {
    let digits = spec
        .chars()
        .map(|c| {
            c.to_digit(10)
                .map(|d| d as usize)
                .ok_or_else(|| VganError::config(format!("malformed {what} spec '{spec}'")))
        })
        .collect::<Result<Vec<_>>>()?;
    let Some(&last) = digits.last() else {
        return Err(VganError::config(format!("empty {what} spec")));
    };
    if digits.contains(&0) {
        return Err(VganError::config(format!("{what} spec '{spec}' contains a zero")));
    }
    Ok((0..stages).map(|i| digits.get(i).copied().unwrap_or(last)).collect())
}

struct Table {
    in_channels: Vec<usize>,
    out_channels: Vec<usize>,
    resample: Vec<bool>,
    resolution: Vec<usize>,
    volumetric: Vec<bool>,
}

fn build(resolution: usize, table: Table, spec: &ArchSpec) -> Result<Architecture> {
    let n = table.in_channels.len();
    debug_assert_eq!(n, table.out_channels.len());
    debug_assert_eq!(n, table.resolution.len());
    let attention = parse_attention(spec.attention)?;
    let kernels = parse_digits(spec.kernel, "kernel", n)?;
    if let Some(k) = kernels.iter().find(|k| *k % 2 == 0) {
        return Err(VganError::config(format!("kernel size {k} must be odd")));
    }
    let dilations = parse_digits(spec.dilation, "dilation", n)?;
    let stages = (0..n)
        .map(|i| StageSpec {
            in_channels: table.in_channels[i],
            out_channels: table.out_channels[i],
            resample: table.resample[i],
            resolution: table.resolution[i],
            attention: attention.contains(&table.resolution[i]),
            volumetric: table.volumetric[i],
            kernel_size: kernels[i],
            dilation: dilations[i],
        })
        .collect();
    Ok(Architecture { resolution, stages })
}

fn scaled(ch: usize, mults: &[usize]) -> Vec<usize> {
    mults.iter().map(|m| m * ch).collect()
}

fn with_rgb(ch: usize, mults: &[usize]) -> Vec<usize> {
    std::iter::once(3).chain(scaled(ch, mults)).collect()
}

fn unsupported(resolution: usize) -> VganError {
    VganError::config(format!(
        "unsupported resolution {resolution} (supported: {SUPPORTED_RESOLUTIONS:?})"
    ))
}

/// Generator stages, starting from an 4x4 (`bottom_width`) feature map.
pub fn generator_arch(resolution: usize, spec: &ArchSpec) -> Result<Architecture> {
    let ch = spec.ch;
    let table = match resolution {
        512 => Table {
            in_channels: scaled(ch, &[16, 16, 8, 8, 4, 2, 1]),
            out_channels: scaled(ch, &[16, 8, 8, 4, 2, 1, 1]),
            resample: vec![true; 7],
            resolution: vec![8, 16, 32, 64, 128, 256, 512],
            volumetric: vec![false; 7],
        },
        256 => Table {
            in_channels: scaled(ch, &[16, 16, 8, 8, 4, 2]),
            out_channels: scaled(ch, &[16, 8, 8, 4, 2, 1]),
            resample: vec![true; 6],
            resolution: vec![8, 16, 32, 64, 128, 256],
            volumetric: vec![false; 6],
        },
        128 => Table {
            in_channels: scaled(ch, &[16, 16, 8, 4, 2]),
            out_channels: scaled(ch, &[16, 8, 4, 2, 1]),
            resample: vec![true; 5],
            resolution: vec![8, 16, 32, 64, 128],
            volumetric: vec![false; 5],
        },
        64 => Table {
            in_channels: scaled(ch, &[8, 8, 8, 4, 2]),
            out_channels: scaled(ch, &[8, 8, 4, 2, 1]),
            resample: vec![true, true, true, true, false],
            resolution: vec![8, 16, 32, 64, 64],
            volumetric: vec![false; 5],
        },
        32 => Table {
            in_channels: scaled(ch, &[4, 4, 4]),
            out_channels: scaled(ch, &[4, 4, 4]),
            resample: vec![true; 3],
            resolution: vec![8, 16, 32],
            volumetric: vec![false; 3],
        },
        other => return Err(unsupported(other)),
    };
    build(resolution, table, spec)
}

/// Per-frame discriminator stages, starting from RGB at full resolution.
pub fn image_discriminator_arch(resolution: usize, spec: &ArchSpec) -> Result<Architecture> {
    let ch = spec.ch;
    let table = match resolution {
        512 => Table {
            in_channels: with_rgb(ch, &[1, 1, 2, 4, 8, 8, 16]),
            out_channels: scaled(ch, &[1, 1, 2, 4, 8, 8, 16, 16]),
            resample: [vec![true; 7], vec![false]].concat(),
            resolution: vec![256, 128, 64, 32, 16, 8, 4, 4],
            volumetric: vec![false; 8],
        },
        256 => Table {
            in_channels: with_rgb(ch, &[1, 2, 4, 8, 8, 16]),
            out_channels: scaled(ch, &[1, 2, 4, 8, 8, 16, 16]),
            resample: [vec![true; 6], vec![false]].concat(),
            resolution: vec![128, 64, 32, 16, 8, 4, 4],
            volumetric: vec![false; 7],
        },
        128 => Table {
            in_channels: with_rgb(ch, &[1, 2, 4, 8, 16]),
            out_channels: scaled(ch, &[1, 2, 4, 8, 16, 16]),
            resample: [vec![true; 5], vec![false]].concat(),
            resolution: vec![64, 32, 16, 8, 4, 4],
            volumetric: vec![false; 6],
        },
        64 => Table {
            in_channels: with_rgb(ch, &[2, 4, 8, 16]),
            out_channels: scaled(ch, &[2, 4, 8, 16, 16]),
            resample: [vec![true; 4], vec![false]].concat(),
            resolution: vec![32, 16, 8, 4, 4],
            volumetric: vec![false; 5],
        },
        32 => Table {
            in_channels: with_rgb(ch, &[4, 4, 4]),
            out_channels: scaled(ch, &[4, 4, 4, 4]),
            resample: vec![true, true, false, false],
            resolution: vec![16, 8, 8, 8],
            volumetric: vec![false; 4],
        },
        other => return Err(unsupported(other)),
    };
    build(resolution, table, spec)
}

/// Clip discriminator stages. Input is spatially halved before the first
/// stage; the two leading stages are volumetric.
pub fn video_discriminator_arch(resolution: usize, spec: &ArchSpec) -> Result<Architecture> {
    let ch = spec.ch;
    let volumetric = |n: usize| [vec![true; 2], vec![false; n - 2]].concat();
    let table = match resolution {
        512 => Table {
            in_channels: with_rgb(ch, &[1, 2, 4, 8, 8, 16]),
            out_channels: scaled(ch, &[1, 2, 4, 8, 8, 16, 16]),
            resample: [vec![true; 6], vec![false]].concat(),
            resolution: vec![128, 64, 32, 16, 8, 4, 4],
            volumetric: volumetric(7),
        },
        256 => Table {
            in_channels: with_rgb(ch, &[1, 2, 4, 8, 8]),
            out_channels: scaled(ch, &[1, 2, 4, 8, 8, 16]),
            resample: [vec![true; 5], vec![false]].concat(),
            resolution: vec![64, 32, 16, 8, 4, 4],
            volumetric: volumetric(6),
        },
        128 => Table {
            in_channels: with_rgb(ch, &[1, 2, 4, 8]),
            out_channels: scaled(ch, &[1, 2, 4, 8, 16]),
            resample: [vec![true; 4], vec![false]].concat(),
            resolution: vec![32, 16, 8, 4, 4],
            volumetric: volumetric(5),
        },
        64 => Table {
            in_channels: with_rgb(ch, &[1, 2, 4]),
            out_channels: scaled(ch, &[1, 2, 4, 8]),
            resample: [vec![true; 3], vec![false]].concat(),
            resolution: vec![16, 8, 4, 4],
            volumetric: volumetric(4),
        },
        32 => Table {
            in_channels: with_rgb(ch, &[4, 4]),
            out_channels: scaled(ch, &[4, 4, 4]),
            resample: vec![true, true, false],
            resolution: vec![8, 4, 4],
            volumetric: volumetric(3),
        },
        other => return Err(unsupported(other)),
    };
    build(resolution, table, spec)
}
