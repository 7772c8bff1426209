//! Splitting files into bulletins and merging bulletins into one file

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::convert::{ETX, SOH, soh_etx, wmo_header};
use super::{BatchFile, PipelineContext, template};
use crate::filter::FileFilter;
use crate::log::{DeleteReason, now_secs};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractFraming {
    /// two byte little endian length
    Vax,
    /// four byte little endian length
    Lbf,
    /// four byte big endian length
    Hbf,
    /// four byte big endian length counting itself
    Mss,
    /// eight digit length and two character format
    Wmo,
    /// SOH .. ETX
    Ascii,
    /// ZCZC .. NNNN
    Zczc,
}

impl ExtractFraming {
    pub fn from_name(name: &str) -> Option<Self> {
        let framing = match name.to_ascii_uppercase().as_str() {
            "VAX" => Self::Vax,
            "LBF" => Self::Lbf,
            "HBF" => Self::Hbf,
            "MSS" => Self::Mss,
            "WMO" => Self::Wmo,
            "ASCII" => Self::Ascii,
            "ZCZC" => Self::Zczc,
            _ => return None,
        };
        Some(framing)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssembleFraming {
    Vax,
    Lbf,
    Hbf,
    Wmo,
    Ascii,
}

impl AssembleFraming {
    pub fn from_name(name: &str) -> Option<Self> {
        let framing = match name.to_ascii_uppercase().as_str() {
            "VAX" => Self::Vax,
            "LBF" => Self::Lbf,
            "HBF" => Self::Hbf,
            "WMO" => Self::Wmo,
            "ASCII" => Self::Ascii,
            _ => return None,
        };
        Some(framing)
    }
}

fn take<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], String> {
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| {
            format!(
                "bulletin at offset {} needs {} bytes, {} left",
                pos,
                len,
                data.len() - *pos
            )
        })?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

fn find(data: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|idx| idx + from)
}

/// Splits `data` into bulletins; empty bulletins are skipped.
pub fn split(framing: ExtractFraming, data: &[u8]) -> Result<Vec<&[u8]>, String> {
    let mut bulletins = Vec::new();
    let mut pos = 0;
    match framing {
        ExtractFraming::Vax | ExtractFraming::Lbf | ExtractFraming::Hbf | ExtractFraming::Mss => {
            while pos < data.len() {
                let len = match framing {
                    ExtractFraming::Vax => {
                        let raw = take(data, &mut pos, 2)?;
                        u16::from_le_bytes([raw[0], raw[1]]) as usize
                    }
                    ExtractFraming::Lbf => {
                        let raw = take(data, &mut pos, 4)?;
                        u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
                    }
                    ExtractFraming::Hbf => {
                        let raw = take(data, &mut pos, 4)?;
                        u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
                    }
                    _ => {
                        let raw = take(data, &mut pos, 4)?;
                        let total = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
                        total.checked_sub(4).ok_or_else(|| {
                            format!("MSS length {} is shorter than its header", total)
                        })?
                    }
                };
                bulletins.push(take(data, &mut pos, len)?);
            }
        }
        ExtractFraming::Wmo => {
            while pos < data.len() {
                let header = take(data, &mut pos, 10)?;
                let len = std::str::from_utf8(&header[..8])
                    .ok()
                    .filter(|digits| digits.bytes().all(|b| b.is_ascii_digit()))
                    .and_then(|digits| digits.parse::<usize>().ok())
                    .ok_or_else(|| format!("invalid WMO length header at offset {}", pos - 10))?;
                bulletins.push(take(data, &mut pos, len)?);
            }
        }
        ExtractFraming::Ascii => {
            while let Some(start) = find(data, &[SOH], pos) {
                let end = find(data, &[ETX], start)
                    .ok_or_else(|| format!("SOH at offset {} has no ETX", start))?;
                bulletins.push(&data[start..=end]);
                pos = end + 1;
            }
            if bulletins.is_empty() {
                return Err("no SOH/ETX framed bulletin found".to_string());
            }
        }
        ExtractFraming::Zczc => {
            while let Some(start) = find(data, b"ZCZC", pos) {
                let end = find(data, b"NNNN", start)
                    .ok_or_else(|| format!("ZCZC at offset {} has no NNNN", start))?;
                bulletins.push(&data[start..end + 4]);
                pos = end + 4;
            }
            if bulletins.is_empty() {
                return Err("no ZCZC/NNNN framed bulletin found".to_string());
            }
        }
    }
    bulletins.retain(|bulletin| !bulletin.is_empty());
    Ok(bulletins)
}

/// File name derived from the abbreviated heading (`TTAAii CCCC YYGGgg [BBB]`).
pub fn bulletin_name(bulletin: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bulletin);
    let heading = text
        .split(['\r', '\n'])
        .map(|line| line.trim_matches(|c: char| c.is_whitespace() || c.is_control()))
        .map(|line| line.strip_prefix("ZCZC").unwrap_or(line).trim())
        .find(|line| !line.is_empty() && !line.bytes().all(|b| b.is_ascii_digit()))?;
    let words: Vec<String> = heading
        .split_whitespace()
        .take(4)
        .map(|word| word.chars().filter(char::is_ascii_alphanumeric).collect::<String>())
        .filter(|word| !word.is_empty())
        .collect();
    (!words.is_empty()).then(|| words.join("_"))
}

/// Frames one file's content for an assembled output.
pub fn frame(framing: AssembleFraming, data: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(data.len() + 16);
    match framing {
        AssembleFraming::Vax => {
            let len = u16::try_from(data.len())
                .map_err(|_| format!("{} bytes do not fit a VAX record", data.len()))?;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(data);
        }
        AssembleFraming::Lbf | AssembleFraming::Hbf => {
            let len = u32::try_from(data.len())
                .map_err(|_| format!("{} bytes do not fit a four byte length", data.len()))?;
            if framing == AssembleFraming::Lbf {
                out.extend_from_slice(&len.to_le_bytes());
            } else {
                out.extend_from_slice(&len.to_be_bytes());
            }
            out.extend_from_slice(data);
        }
        AssembleFraming::Wmo => {
            if data.len() > 99_999_999 {
                return Err(format!("{} bytes do not fit a WMO header", data.len()));
            }
            out.extend_from_slice(&wmo_header(data.len(), b"BI"));
            out.extend_from_slice(data);
        }
        AssembleFraming::Ascii => out = soh_etx(data),
    }
    Ok(out)
}

/// Replaces every file of the batch by the bulletins it contains.
pub(super) async fn extract(
    ctx: &mut PipelineContext<'_>,
    option: &str,
    framing: ExtractFraming,
    filter: Option<&FileFilter>,
) -> anyhow::Result<()> {
    let originals: Vec<BatchFile> = ctx.batch.files.clone();
    let mut created: Vec<String> = Vec::new();
    for original in &originals {
        let Some(index) = ctx.batch.position(&original.name) else {
            continue;
        };
        let data = match tokio::fs::read(ctx.path(&original.name)).await {
            Ok(data) => data,
            Err(error) => {
                let detail = format!("read failed: {}", error);
                ctx.drop_file(index, DeleteReason::OptionFailed, option, &detail, false)
                    .await;
                continue;
            }
        };
        let bulletins = match split(framing, &data) {
            Ok(bulletins) => bulletins,
            Err(detail) => {
                ctx.drop_file(index, DeleteReason::OptionFailed, option, &detail, false)
                    .await;
                continue;
            }
        };
        let mut discarded = 0;
        for (number, bulletin) in bulletins.iter().enumerate() {
            let name = bulletin_name(bulletin)
                .unwrap_or_else(|| format!("{}-{}", original.name, number));
            if filter.is_some_and(|filter| !filter.is_match(&name)) {
                discarded += 1;
                continue;
            }
            let mut unique = name.clone();
            if created.contains(&unique) || ctx.is_taken(&unique, None).await {
                unique = match ctx.free_variant(&name, None).await {
                    Some(variant) if !created.contains(&variant) => variant,
                    _ => format!("{}-{}", name, ctx.env.next_counter()),
                };
            }
            tokio::fs::write(ctx.path(&unique), bulletin)
                .await
                .with_context(|| format!("failed to write bulletin {:?}", ctx.path(&unique)))?;
            ctx.log_production(option, original, &unique, bulletin.len() as u64, 0)
                .await;
            ctx.summary.files_created += 1;
            created.push(unique);
        }
        if discarded > 0 {
            tracing::debug!(
                "{}: {} bulletins of '{}' did not pass the filter",
                option,
                discarded,
                original.name
            );
        }
        if let Err(error) = tokio::fs::remove_file(ctx.path(&original.name)).await {
            tracing::warn!("failed to remove extracted file {:?}: {}", original.name, error);
        }
    }
    ctx.recount().await
}

/// Merges the whole batch into one file named by `name_template`.
pub(super) async fn assemble(
    ctx: &mut PipelineContext<'_>,
    option: &str,
    framing: AssembleFraming,
    name_template: &str,
) -> anyhow::Result<()> {
    let name = template::expand(
        name_template,
        &template::TemplateValues {
            captures: None,
            time: now_secs(),
            hostname: &ctx.env.hostname,
            counter: ctx.env.next_counter(),
        },
    );
    if name.is_empty() || name.starts_with('.') || name.contains('/') {
        ctx.warn(format_args!(
            "assemble template '{}' gives unusable name '{}', option skipped",
            name_template, name
        ));
        ctx.summary.options_skipped += 1;
        return Ok(());
    }
    let mut out = Vec::new();
    let mut used = Vec::new();
    let originals: Vec<BatchFile> = ctx.batch.files.clone();
    for original in &originals {
        let framed = match tokio::fs::read(ctx.path(&original.name)).await {
            Ok(data) => frame(framing, &data),
            Err(error) => Err(format!("read failed: {}", error)),
        };
        match framed {
            Ok(framed) => {
                out.extend_from_slice(&framed);
                used.push(original);
            }
            Err(detail) => {
                if let Some(index) = ctx.batch.position(&original.name) {
                    ctx.drop_file(index, DeleteReason::OptionFailed, option, &detail, false)
                        .await;
                }
            }
        }
    }
    if used.is_empty() {
        return ctx.recount().await;
    }
    let temp = ctx.path(&format!(".{}", name));
    tokio::fs::write(&temp, &out)
        .await
        .with_context(|| format!("failed to write {:?}", temp))?;
    for original in &used {
        if let Err(error) = tokio::fs::remove_file(ctx.path(&original.name)).await {
            tracing::warn!("failed to remove assembled file {:?}: {}", original.name, error);
        }
    }
    let target = if ctx.is_taken(&name, None).await {
        ctx.free_variant(&name, None)
            .await
            .unwrap_or_else(|| format!("{}-{}", name, ctx.env.next_counter()))
    } else {
        name
    };
    tokio::fs::rename(&temp, ctx.path(&target))
        .await
        .with_context(|| format!("failed to move {:?} to {:?}", temp, target))?;
    for original in &used {
        ctx.log_production(option, original, &target, out.len() as u64, 0)
            .await;
    }
    ctx.summary.files_created += 1;
    ctx.recount().await
}
