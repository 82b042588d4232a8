//! Capture a fixed sequence of kernel launches and replay it.
//!
//! On CUDA the launches are recorded into a CUDA graph through stream
//! capture and replayed with a single `cuGraphLaunch`. On CPU there is
//! nothing to record, so replay re-runs the launch closure eagerly.

use candle_core::{Device, Result};

/// A recorded batch of `launches` invocations of one closure.
pub struct LaunchGraph<'a> {
    launches: usize,
    inner: GraphInner<'a>,
}

enum GraphInner<'a> {
    Eager(Box<dyn FnMut() -> Result<()> + 'a>),
    #[cfg(feature = "cuda-kernels")]
    Cuda {
        graph: cuda::CudaGraph,
        // Owns the buffers the recorded launches read from
        _launch: Box<dyn FnMut() -> Result<()> + 'a>,
    },
}

impl<'a> LaunchGraph<'a> {
    /// Record `launches` calls of `launch` on `device`.
    ///
    /// On CUDA the closure runs once uncaptured first so module loading and
    /// allocations happen outside the graph.
    pub fn capture<F>(device: &Device, launches: usize, launch: F) -> Result<Self>
    where
        F: FnMut() -> Result<()> + 'a,
    {
        if launches == 0 {
            candle_core::bail!("launch graph needs at least one launch");
        }
        match device {
            Device::Cpu => Ok(Self {
                launches,
                inner: GraphInner::Eager(Box::new(launch)),
            }),
            #[cfg(feature = "cuda-kernels")]
            Device::Cuda(_) => {
                let mut launch: Box<dyn FnMut() -> Result<()> + 'a> = Box::new(launch);
                let graph = cuda::capture(device, launches, &mut *launch)?;
                Ok(Self {
                    launches,
                    inner: GraphInner::Cuda {
                        graph,
                        _launch: launch,
                    },
                })
            }
            _ => candle_core::bail!("launch graph: unsupported device {device:?}"),
        }
    }

    /// Number of launches recorded.
    pub fn launches(&self) -> usize {
        self.launches
    }

    /// Execute every recorded launch once more.
    ///
    /// CUDA replay is asynchronous; synchronize the device before reading
    /// results or stopping a timer.
    pub fn replay(&mut self) -> Result<()> {
        match &mut self.inner {
            GraphInner::Eager(launch) => {
                for _ in 0..self.launches {
                    launch()?;
                }
                Ok(())
            }
            #[cfg(feature = "cuda-kernels")]
            GraphInner::Cuda { graph, .. } => graph.launch(),
        }
    }
}

#[cfg(feature = "cuda-kernels")]
mod cuda {
    use candle_core::cuda::cudarc::driver::sys::{
        cuCtxSynchronize, cuGraphDestroy, cuGraphExecDestroy, cuGraphInstantiateWithFlags,
        cuGraphLaunch, cuStreamBeginCapture_v2, cuStreamEndCapture, CUgraph, CUgraphExec,
        CUresult, CUstream, CUstreamCaptureMode,
    };
    use candle_core::{Device, Result};

    pub(super) struct CudaGraph {
        graph: CUgraph,
        graph_exec: CUgraphExec,
        stream: CUstream,
    }

    impl Drop for CudaGraph {
        fn drop(&mut self) {
            unsafe {
                if !self.graph_exec.is_null() {
                    cuGraphExecDestroy(self.graph_exec);
                }
                if !self.graph.is_null() {
                    cuGraphDestroy(self.graph);
                }
            }
        }
    }

    fn check(result: CUresult, what: &str) -> Result<()> {
        if result != CUresult::CUDA_SUCCESS {
            candle_core::bail!("launch graph: {what} failed with {result:?}");
        }
        Ok(())
    }

    pub(super) fn capture(
        device: &Device,
        launches: usize,
        launch: &mut dyn FnMut() -> Result<()>,
    ) -> Result<CudaGraph> {
        let stream = match device {
            Device::Cuda(dev) => dev.cuda_stream().cu_stream(),
            _ => candle_core::bail!("launch graph: device is not CUDA"),
        };

        launch()?;
        check(unsafe { cuCtxSynchronize() }, "synchronize")?;

        check(
            unsafe {
                cuStreamBeginCapture_v2(stream, CUstreamCaptureMode::CU_STREAM_CAPTURE_MODE_GLOBAL)
            },
            "begin capture",
        )?;

        for _ in 0..launches {
            if let Err(e) = launch() {
                // Abort capture on error
                let mut graph: CUgraph = std::ptr::null_mut();
                unsafe {
                    cuStreamEndCapture(stream, &mut graph);
                    if !graph.is_null() {
                        cuGraphDestroy(graph);
                    }
                }
                return Err(e);
            }
        }

        let mut graph: CUgraph = std::ptr::null_mut();
        check(unsafe { cuStreamEndCapture(stream, &mut graph) }, "end capture")?;
        if graph.is_null() {
            candle_core::bail!("launch graph: capture produced no graph");
        }

        let mut graph_exec: CUgraphExec = std::ptr::null_mut();
        let inst_result = unsafe { cuGraphInstantiateWithFlags(&mut graph_exec, graph, 0) };
        if inst_result != CUresult::CUDA_SUCCESS {
            unsafe {
                cuGraphDestroy(graph);
            }
            candle_core::bail!("launch graph: instantiate failed with {inst_result:?}");
        }

        Ok(CudaGraph {
            graph,
            graph_exec,
            stream,
        })
    }

    impl CudaGraph {
        pub(super) fn launch(&self) -> Result<()> {
            check(
                unsafe { cuGraphLaunch(self.graph_exec, self.stream) },
                "graph launch",
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_cpu_capture_does_not_run() {
        let calls = Cell::new(0);
        let graph = LaunchGraph::capture(&Device::Cpu, 10, || {
            calls.set(calls.get() + 1);
            Ok(())
        })
        .unwrap();
        assert_eq!(graph.launches(), 10);
        drop(graph);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_cpu_replay_runs_every_launch() {
        let calls = Cell::new(0);
        let mut graph = LaunchGraph::capture(&Device::Cpu, 10, || {
            calls.set(calls.get() + 1);
            Ok(())
        })
        .unwrap();
        graph.replay().unwrap();
        graph.replay().unwrap();
        drop(graph);
        assert_eq!(calls.get(), 20);
    }

    #[test]
    fn test_replay_propagates_errors() {
        let mut graph = LaunchGraph::capture(&Device::Cpu, 3, || {
            candle_core::bail!("boom")
        })
        .unwrap();
        assert!(graph.replay().is_err());
    }

    #[test]
    fn test_zero_launches_rejected() {
        assert!(LaunchGraph::capture(&Device::Cpu, 0, || Ok(())).is_err());
    }
}
