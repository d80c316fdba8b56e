//! Host implementation of the [`Kernel`] instruction set.
//!
//! Device memory of an emulated device is a table of slot vectors. Kernel
//! execution takes the output slots out of the table, reads inputs in place,
//! and puts the outputs back, so an output that aliases an input shows up as a
//! zero-length input and is rejected.

use crate::error::DeviceError;
use crate::volume::Extent;

use super::{Kernel, SlotHandle};

/// Slot storage of one emulated device.
#[derive(Default)]
pub(crate) struct SlotMemory {
    slots: Vec<Option<Vec<f32>>>,
}

impl SlotMemory {
    /// Appends `count` zeroed slots and returns the index of the first.
    pub fn grow(&mut self, count: usize, slot_len: usize) -> u32 {
        let first = self.slots.len() as u32;
        self.slots
            .extend((0..count).map(|_| Some(vec![0.0; slot_len])));
        first
    }

    /// Frees one slot.
    pub fn free(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            *slot = None;
        }
    }

    /// Frees everything.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Read access to a live slot.
    pub fn read(&self, handle: SlotHandle) -> Result<&[f32], DeviceError> {
        self.slots
            .get(handle.index as usize)
            .and_then(|s| s.as_deref())
            .ok_or_else(|| DeviceError::InvalidSlot(format!("{handle} is not allocated")))
    }

    /// Write access to a live slot.
    pub fn write(&mut self, handle: SlotHandle) -> Result<&mut [f32], DeviceError> {
        self.slots
            .get_mut(handle.index as usize)
            .and_then(|s| s.as_deref_mut())
            .ok_or_else(|| DeviceError::InvalidSlot(format!("{handle} is not allocated")))
    }

    fn take(&mut self, handle: SlotHandle) -> Result<Vec<f32>, DeviceError> {
        self.slots
            .get_mut(handle.index as usize)
            .and_then(|s| s.as_mut())
            .map(core::mem::take)
            .ok_or_else(|| DeviceError::InvalidSlot(format!("{handle} is not allocated")))
    }

    fn restore(&mut self, handle: SlotHandle, data: Vec<f32>) {
        if let Some(Some(slot)) = self.slots.get_mut(handle.index as usize) {
            *slot = data;
        }
    }

    /// Runs `f` with the given output slots checked out of the table.
    fn with_outputs<const N: usize>(
        &mut self,
        outputs: [SlotHandle; N],
        f: impl FnOnce(&Self, &mut [Vec<f32>; N]) -> Result<(), DeviceError>,
    ) -> Result<(), DeviceError> {
        let mut taken: [Vec<f32>; N] = core::array::from_fn(|_| Vec::new());
        for (i, &handle) in outputs.iter().enumerate() {
            match self.take(handle) {
                Ok(data) if !data.is_empty() => taken[i] = data,
                Ok(_) => {
                    self.put_back(&outputs[..i], &mut taken);
                    return Err(DeviceError::Launch(format!("output {handle} listed twice")));
                }
                Err(e) => {
                    self.put_back(&outputs[..i], &mut taken);
                    return Err(e);
                }
            }
        }
        let result = f(self, &mut taken);
        self.put_back(&outputs, &mut taken);
        result
    }

    fn put_back<const N: usize>(&mut self, outputs: &[SlotHandle], taken: &mut [Vec<f32>; N]) {
        for (i, &handle) in outputs.iter().enumerate() {
            self.restore(handle, core::mem::take(&mut taken[i]));
        }
    }

    /// Reads an input slot and checks it matches the output length.
    fn input(&self, handle: SlotHandle, len: usize) -> Result<&[f32], DeviceError> {
        let data = self.read(handle)?;
        if data.len() != len {
            return Err(DeviceError::Launch(format!(
                "input {handle} has {} values, expected {len} (aliased with an output?)",
                data.len()
            )));
        }
        Ok(data)
    }
}

fn check_extent(extent: Extent, len: usize) -> Result<(), DeviceError> {
    if extent.voxels() != len {
        return Err(DeviceError::Launch(format!(
            "extent {extent} does not match slot length {len}"
        )));
    }
    Ok(())
}

/// Every slot a kernel names, inputs and outputs alike.
pub(crate) fn slots(kernel: &Kernel) -> impl Iterator<Item = SlotHandle> {
    let list: Vec<SlotHandle> = match *kernel {
        Kernel::Fill { dst, .. } | Kernel::Clamp { dst, .. } => vec![dst],
        Kernel::Copy { src, dst } | Kernel::Accumulate { dst, src, .. } => vec![dst, src],
        Kernel::FlowResidual {
            dst,
            div,
            sink,
            source,
            label,
            ..
        } => vec![dst, div, sink, source, label],
        Kernel::GradientStep { flow, field, .. } => vec![flow[0], flow[1], flow[2], field],
        Kernel::ProjectFlow {
            flow, smoothness, ..
        } => flow.iter().copied().chain(smoothness).collect(),
        Kernel::Divergence { dst, flow, .. } => vec![dst, flow[0], flow[1], flow[2]],
        Kernel::LeafSink {
            sink,
            source,
            div,
            label,
            data,
            ..
        } => vec![sink, source, div, label, data],
        Kernel::ChildTerm {
            acc,
            sink,
            div,
            label,
            ..
        } => vec![acc, sink, div, label],
        Kernel::BranchSink {
            sink,
            source,
            div,
            label,
            acc,
            ..
        } => vec![sink, source, div, label, acc],
        Kernel::RootSource { source, acc, .. } => vec![source, acc],
        Kernel::LabelUpdate {
            label,
            div,
            sink,
            source,
            ..
        } => vec![label, div, sink, source],
    };
    list.into_iter()
}

/// Executes one kernel against device memory.
pub(crate) fn execute(mem: &mut SlotMemory, kernel: &Kernel) -> Result<(), DeviceError> {
    match *kernel {
        Kernel::Fill { dst, value } => {
            mem.write(dst)?.fill(value);
            Ok(())
        }
        Kernel::Copy { src, dst } => mem.with_outputs([dst], |m, [d]| {
            let n = d.len();
            d.copy_from_slice(m.input(src, n)?);
            Ok(())
        }),
        Kernel::Accumulate { dst, src, scale } => mem.with_outputs([dst], |m, [d]| {
            let s = m.input(src, d.len())?;
            for (d, &s) in d.iter_mut().zip(s) {
                *d += scale * s;
            }
            Ok(())
        }),
        Kernel::Clamp { dst, lo, hi } => {
            for v in mem.write(dst)? {
                *v = v.clamp(lo, hi);
            }
            Ok(())
        }
        Kernel::FlowResidual {
            dst,
            div,
            sink,
            source,
            label,
            inv_cc,
        } => mem.with_outputs([dst], |m, [w]| {
            let n = w.len();
            let (div, sink, source, label) = (
                m.input(div, n)?,
                m.input(sink, n)?,
                m.input(source, n)?,
                m.input(label, n)?,
            );
            for i in 0..n {
                w[i] = div[i] - source[i] + sink[i] - label[i] * inv_cc;
            }
            Ok(())
        }),
        Kernel::GradientStep {
            flow,
            field,
            step,
            extent,
        } => mem.with_outputs(flow, |m, [fx, fy, fz]| {
            let n = fx.len();
            check_extent(extent, n)?;
            let w = m.input(field, n)?;
            let (sx, sy, sz) = extent.strides();
            for z in 0..extent.z {
                for y in 0..extent.y {
                    for x in 0..extent.x {
                        let i = extent.index(x, y, z);
                        if x + 1 < extent.x {
                            fx[i] += step * (w[i + sx] - w[i]);
                        }
                        if y + 1 < extent.y {
                            fy[i] += step * (w[i + sy] - w[i]);
                        }
                        if z + 1 < extent.z {
                            fz[i] += step * (w[i + sz] - w[i]);
                        }
                    }
                }
            }
            Ok(())
        }),
        Kernel::ProjectFlow {
            flow,
            smoothness,
            alpha,
        } => mem.with_outputs(flow, |m, [fx, fy, fz]| {
            let n = fx.len();
            let smooth = smoothness.map(|s| m.input(s, n)).transpose()?;
            for i in 0..n {
                let bound = alpha * smooth.map_or(1.0, |s| s[i]).max(0.0);
                let magnitude = (fx[i] * fx[i] + fy[i] * fy[i] + fz[i] * fz[i]).sqrt();
                if magnitude > bound {
                    let scale = if magnitude > 0.0 { bound / magnitude } else { 0.0 };
                    fx[i] *= scale;
                    fy[i] *= scale;
                    fz[i] *= scale;
                }
            }
            Ok(())
        }),
        Kernel::Divergence { dst, flow, extent } => mem.with_outputs([dst], |m, [d]| {
            let n = d.len();
            check_extent(extent, n)?;
            let (fx, fy, fz) = (m.input(flow[0], n)?, m.input(flow[1], n)?, m.input(flow[2], n)?);
            let (sx, sy, sz) = extent.strides();
            for z in 0..extent.z {
                for y in 0..extent.y {
                    for x in 0..extent.x {
                        let i = extent.index(x, y, z);
                        let mut v = 0.0;
                        if x + 1 < extent.x {
                            v += fx[i];
                        }
                        if x > 0 {
                            v -= fx[i - sx];
                        }
                        if y + 1 < extent.y {
                            v += fy[i];
                        }
                        if y > 0 {
                            v -= fy[i - sy];
                        }
                        if z + 1 < extent.z {
                            v += fz[i];
                        }
                        if z > 0 {
                            v -= fz[i - sz];
                        }
                        d[i] = v;
                    }
                }
            }
            Ok(())
        }),
        Kernel::LeafSink {
            sink,
            source,
            div,
            label,
            data,
            inv_cc,
        } => mem.with_outputs([sink], |m, [p]| {
            let n = p.len();
            let (source, div, label, data) = (
                m.input(source, n)?,
                m.input(div, n)?,
                m.input(label, n)?,
                m.input(data, n)?,
            );
            for i in 0..n {
                p[i] = (source[i] - div[i] + label[i] * inv_cc).min(data[i]);
            }
            Ok(())
        }),
        Kernel::ChildTerm {
            acc,
            sink,
            div,
            label,
            inv_cc,
        } => mem.with_outputs([acc], |m, [a]| {
            let n = a.len();
            let (sink, div, label) = (m.input(sink, n)?, m.input(div, n)?, m.input(label, n)?);
            for i in 0..n {
                a[i] += sink[i] + div[i] - label[i] * inv_cc;
            }
            Ok(())
        }),
        Kernel::BranchSink {
            sink,
            source,
            div,
            label,
            acc,
            inv_cc,
            children,
        } => mem.with_outputs([sink], |m, [p]| {
            let n = p.len();
            let (source, div, label, acc) = (
                m.input(source, n)?,
                m.input(div, n)?,
                m.input(label, n)?,
                m.input(acc, n)?,
            );
            let norm = 1.0 / (children as f32 + 1.0);
            for i in 0..n {
                p[i] = (source[i] - div[i] + label[i] * inv_cc + acc[i]) * norm;
            }
            Ok(())
        }),
        Kernel::RootSource {
            source,
            acc,
            inv_cc,
            children,
        } => {
            if children == 0 {
                return Err(DeviceError::Launch("root source with no children".into()));
            }
            mem.with_outputs([source], |m, [ps]| {
                let acc = m.input(acc, ps.len())?;
                let norm = 1.0 / children as f32;
                for (ps, &a) in ps.iter_mut().zip(acc) {
                    *ps = (inv_cc + a) * norm;
                }
                Ok(())
            })
        }
        Kernel::LabelUpdate {
            label,
            div,
            sink,
            source,
            step,
        } => mem.with_outputs([label], |m, [u]| {
            let n = u.len();
            let (div, sink, source) = (m.input(div, n)?, m.input(sink, n)?, m.input(source, n)?);
            for i in 0..n {
                u[i] = (u[i] - step * (div[i] + sink[i] - source[i])).clamp(0.0, 1.0);
            }
            Ok(())
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DeviceId;

    fn handle(index: u32) -> SlotHandle {
        SlotHandle {
            device: DeviceId(0),
            index,
        }
    }

    fn memory(count: usize, len: usize) -> SlotMemory {
        let mut mem = SlotMemory::default();
        mem.grow(count, len);
        mem
    }

    fn set(mem: &mut SlotMemory, index: u32, values: &[f32]) {
        mem.write(handle(index)).unwrap().copy_from_slice(values);
    }

    #[test]
    fn divergence_is_negative_adjoint_of_gradient() {
        let extent = Extent::new(3, 2, 2);
        let n = extent.voxels();
        let mut mem = memory(6, n);
        // w in slot 0, flow in 1..4, divergence in 4.
        let w: Vec<f32> = (0..n).map(|i| ((i * 7) % 5) as f32 - 1.5).collect();
        set(&mut mem, 0, &w);
        let flow = [handle(1), handle(2), handle(3)];
        execute(
            &mut mem,
            &Kernel::GradientStep {
                flow,
                field: handle(0),
                step: 1.0,
                extent,
            },
        )
        .unwrap();
        let q: Vec<Vec<f32>> = (0..3)
            .map(|c| (0..n).map(|i| ((i + c * 3) % 4) as f32 * 0.25).collect())
            .collect();
        let gx = mem.read(handle(1)).unwrap().to_vec();
        let gy = mem.read(handle(2)).unwrap().to_vec();
        let gz = mem.read(handle(3)).unwrap().to_vec();
        let lhs: f32 = (0..n)
            .map(|i| gx[i] * q[0][i] + gy[i] * q[1][i] + gz[i] * q[2][i])
            .sum();

        for (c, comp) in q.iter().enumerate() {
            set(&mut mem, 1 + c as u32, comp);
        }
        execute(
            &mut mem,
            &Kernel::Divergence {
                dst: handle(4),
                flow,
                extent,
            },
        )
        .unwrap();
        let div = mem.read(handle(4)).unwrap();
        // <grad w, q> == -<w, div q>; upper-face q drops out of both sides.
        let rhs: f32 = -(0..n).map(|i| w[i] * div[i]).sum::<f32>();
        assert!((lhs - rhs).abs() < 1e-4, "{lhs} vs {rhs}");
    }

    #[test]
    fn projection_bounds_magnitude() {
        let mut mem = memory(4, 2);
        set(&mut mem, 0, &[3.0, 0.1]);
        set(&mut mem, 1, &[4.0, 0.0]);
        set(&mut mem, 3, &[2.0, 2.0]);
        execute(
            &mut mem,
            &Kernel::ProjectFlow {
                flow: [handle(0), handle(1), handle(2)],
                smoothness: Some(handle(3)),
                alpha: 0.5,
            },
        )
        .unwrap();
        let fx = mem.read(handle(0)).unwrap();
        let fy = mem.read(handle(1)).unwrap();
        // |(3,4)| = 5 scaled down to 1.0.
        assert!((fx[0] - 0.6).abs() < 1e-6);
        assert!((fy[0] - 0.8).abs() < 1e-6);
        // Already within bound.
        assert_eq!(fx[1], 0.1);
    }

    #[test]
    fn leaf_sink_is_capped_by_data() {
        let mut mem = memory(5, 2);
        set(&mut mem, 1, &[1.0, 1.0]); // source
        set(&mut mem, 2, &[0.0, 0.0]); // div
        set(&mut mem, 3, &[0.5, 0.0]); // label
        set(&mut mem, 4, &[10.0, 0.2]); // data
        execute(
            &mut mem,
            &Kernel::LeafSink {
                sink: handle(0),
                source: handle(1),
                div: handle(2),
                label: handle(3),
                data: handle(4),
                inv_cc: 4.0,
            },
        )
        .unwrap();
        assert_eq!(mem.read(handle(0)).unwrap(), &[3.0, 0.2]);
    }

    #[test]
    fn label_update_clamps() {
        let mut mem = memory(4, 3);
        set(&mut mem, 0, &[0.5, 0.95, 0.05]);
        set(&mut mem, 2, &[0.0, 0.0, 2.0]); // sink
        set(&mut mem, 3, &[0.0, 2.0, 0.0]); // source
        execute(
            &mut mem,
            &Kernel::LabelUpdate {
                label: handle(0),
                div: handle(1),
                sink: handle(2),
                source: handle(3),
                step: 0.1,
            },
        )
        .unwrap();
        let u = mem.read(handle(0)).unwrap();
        assert_eq!(u[0], 0.5);
        assert_eq!(u[1], 1.0);
        assert_eq!(u[2], 0.0);
    }

    #[test]
    fn aliased_output_is_rejected() {
        let mut mem = memory(2, 4);
        let err = execute(
            &mut mem,
            &Kernel::Accumulate {
                dst: handle(0),
                src: handle(0),
                scale: 1.0,
            },
        )
        .unwrap_err();
        assert!(matches!(err, DeviceError::Launch(_)));
        // The slot survives the failed launch.
        assert_eq!(mem.read(handle(0)).unwrap().len(), 4);
    }

    #[test]
    fn freed_slot_is_invalid() {
        let mut mem = memory(1, 4);
        mem.free(0);
        assert!(matches!(
            mem.read(handle(0)),
            Err(DeviceError::InvalidSlot(_))
        ));
    }
}
