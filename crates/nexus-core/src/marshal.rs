//! Argument lowering and native call dispatch
//!
//! A call request's typed parameters are lowered to machine words, then
//! dispatched through a monomorphic trampoline picked by (convention,
//! arity). The trampoline invocation runs inside a structured-fault guard:
//! a bad registered address or a function that faults on our arguments
//! becomes an error response, never a host crash.
//!
//! Dispatch targets the 32-bit x86 Windows ABI, where cdecl, stdcall and
//! thiscall differ; other build targets get a typed error.

use crate::functions::FunctionRecord;
use crate::traits::MemoryAccess;
use nexus_common::protocol::{CallConvention, Param};
use nexus_common::{Error, Result};

/// Trampolines exist for arities 0 through 6.
pub const MAX_DISPATCH_ARGS: usize = 6;

/// Outcome of a native call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOutcome {
    pub has_return: bool,
    /// Raw pointer-width return value; the wire exposes the low 32 bits.
    pub value: usize,
}

/// Lower typed parameters into machine words.
///
/// String words point into the `Param` buffers, so the returned words are
/// only valid while `params` is alive.
fn lower_args(params: &[Param]) -> Result<Vec<usize>> {
    params
        .iter()
        .map(|param| match param {
            Param::I8(v) => Ok(*v as isize as usize),
            Param::I16(v) => Ok(*v as isize as usize),
            Param::I32(v) => Ok(*v as isize as usize),
            Param::F32(v) => Ok(v.to_bits() as usize),
            Param::Pointer(v) => Ok(*v),
            Param::Str(bytes) => Ok(bytes.as_ptr() as usize),
            Param::WStr(units) => Ok(units.as_ptr() as usize),
            // 64-bit values do not fit one machine word on the target host.
            Param::I64(_) | Param::F64(_) => Err(Error::InvalidArgument(format!(
                "Unsupported parameter type: {}",
                param.tag()
            ))),
        })
        .collect()
}

/// Marshal `params` into `record`'s call site and invoke it.
///
/// Runs on the host thread via the pending-call queue; never call this from
/// a worker thread directly.
pub fn invoke(
    memory: &dyn MemoryAccess,
    record: &FunctionRecord,
    params: &[Param],
) -> Result<CallOutcome> {
    if params.len() != record.param_count as usize {
        return Err(Error::InvalidArgument(format!(
            "Parameter count mismatch for '{}'",
            record.name
        )));
    }
    if params.len() > MAX_DISPATCH_ARGS {
        return Err(Error::InvalidArgument(format!(
            "Too many parameters: {} (max {})",
            params.len(),
            MAX_DISPATCH_ARGS
        )));
    }

    let args = lower_args(params)?;

    match record.convention {
        CallConvention::Fastcall => {
            return Err(Error::InvalidArgument(
                "Fastcall convention is not supported".into(),
            ));
        }
        CallConvention::Thiscall => {
            // Parameter 0 is the implicit instance pointer.
            let instance = args.first().copied().unwrap_or(0);
            if instance == 0 {
                return Err(Error::InvalidArgument(
                    "Thiscall requires an instance pointer".into(),
                ));
            }
            memory.probe_committed(instance)?;
        }
        CallConvention::Cdecl | CallConvention::Stdcall => {}
    }

    let value = dispatch(record.convention, record.address, &args).map_err(|e| {
        nexus_common::error!(
            target: "nexus_core::marshal",
            function = %record.name,
            address = format!("{:#x}", record.address),
            error = %e,
            "Native call failed"
        );
        e
    })?;

    Ok(CallOutcome {
        has_return: record.has_return,
        value,
    })
}

#[cfg(all(windows, target_arch = "x86"))]
fn dispatch(convention: CallConvention, address: usize, args: &[usize]) -> Result<usize> {
    let guarded = microseh::try_seh(|| unsafe {
        match convention {
            CallConvention::Cdecl => dispatch_cdecl(address, args),
            CallConvention::Stdcall => dispatch_stdcall(address, args),
            CallConvention::Thiscall => dispatch_thiscall(address, args),
            CallConvention::Fastcall => unreachable!("rejected before dispatch"),
        }
    });
    guarded.map_err(|_| Error::access_violation(address, format!("{} call", convention)))
}

#[cfg(all(windows, target_arch = "x86"))]
unsafe fn dispatch_cdecl(address: usize, args: &[usize]) -> usize {
    use std::mem::transmute;
    match *args {
        [] => transmute::<usize, extern "cdecl" fn() -> usize>(address)(),
        [a] => transmute::<usize, extern "cdecl" fn(usize) -> usize>(address)(a),
        [a, b] => transmute::<usize, extern "cdecl" fn(usize, usize) -> usize>(address)(a, b),
        [a, b, c] => {
            transmute::<usize, extern "cdecl" fn(usize, usize, usize) -> usize>(address)(a, b, c)
        }
        [a, b, c, d] => transmute::<usize, extern "cdecl" fn(usize, usize, usize, usize) -> usize>(
            address,
        )(a, b, c, d),
        [a, b, c, d, e] => transmute::<
            usize,
            extern "cdecl" fn(usize, usize, usize, usize, usize) -> usize,
        >(address)(a, b, c, d, e),
        [a, b, c, d, e, f] => transmute::<
            usize,
            extern "cdecl" fn(usize, usize, usize, usize, usize, usize) -> usize,
        >(address)(a, b, c, d, e, f),
        _ => 0,
    }
}

#[cfg(all(windows, target_arch = "x86"))]
unsafe fn dispatch_stdcall(address: usize, args: &[usize]) -> usize {
    use std::mem::transmute;
    match *args {
        [] => transmute::<usize, extern "stdcall" fn() -> usize>(address)(),
        [a] => transmute::<usize, extern "stdcall" fn(usize) -> usize>(address)(a),
        [a, b] => transmute::<usize, extern "stdcall" fn(usize, usize) -> usize>(address)(a, b),
        [a, b, c] => {
            transmute::<usize, extern "stdcall" fn(usize, usize, usize) -> usize>(address)(a, b, c)
        }
        [a, b, c, d] => transmute::<
            usize,
            extern "stdcall" fn(usize, usize, usize, usize) -> usize,
        >(address)(a, b, c, d),
        [a, b, c, d, e] => transmute::<
            usize,
            extern "stdcall" fn(usize, usize, usize, usize, usize) -> usize,
        >(address)(a, b, c, d, e),
        [a, b, c, d, e, f] => transmute::<
            usize,
            extern "stdcall" fn(usize, usize, usize, usize, usize, usize) -> usize,
        >(address)(a, b, c, d, e, f),
        _ => 0,
    }
}

#[cfg(all(windows, target_arch = "x86"))]
unsafe fn dispatch_thiscall(address: usize, args: &[usize]) -> usize {
    use std::mem::transmute;
    match *args {
        [a] => transmute::<usize, extern "thiscall" fn(usize) -> usize>(address)(a),
        [a, b] => transmute::<usize, extern "thiscall" fn(usize, usize) -> usize>(address)(a, b),
        [a, b, c] => transmute::<usize, extern "thiscall" fn(usize, usize, usize) -> usize>(
            address,
        )(a, b, c),
        [a, b, c, d] => transmute::<
            usize,
            extern "thiscall" fn(usize, usize, usize, usize) -> usize,
        >(address)(a, b, c, d),
        [a, b, c, d, e] => transmute::<
            usize,
            extern "thiscall" fn(usize, usize, usize, usize, usize) -> usize,
        >(address)(a, b, c, d, e),
        [a, b, c, d, e, f] => transmute::<
            usize,
            extern "thiscall" fn(usize, usize, usize, usize, usize, usize) -> usize,
        >(address)(a, b, c, d, e, f),
        _ => 0,
    }
}

#[cfg(not(all(windows, target_arch = "x86")))]
fn dispatch(_convention: CallConvention, _address: usize, _args: &[usize]) -> Result<usize> {
    Err(Error::Internal(
        "Native function dispatch requires a 32-bit x86 Windows host".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMemory;

    fn record(convention: CallConvention, param_count: u8) -> FunctionRecord {
        FunctionRecord {
            name: "probe".to_string(),
            address: 0x0040_1000,
            param_count,
            convention,
            has_return: true,
        }
    }

    #[test]
    fn test_lower_sign_extends_integers() {
        let args = lower_args(&[Param::I8(-1), Param::I16(-2), Param::I32(-3)]).unwrap();
        assert_eq!(args[0], usize::MAX);
        assert_eq!(args[1], (-2isize) as usize);
        assert_eq!(args[2], (-3isize) as usize);
    }

    #[test]
    fn test_lower_bitcasts_f32() {
        let args = lower_args(&[Param::F32(2.5)]).unwrap();
        assert_eq!(args[0] as u32, 2.5f32.to_bits());
    }

    #[test]
    fn test_lower_strings_are_pointers_into_params() {
        let params = vec![Param::ansi("chat"), Param::wide("w")];
        let args = lower_args(&params).unwrap();
        match (&params[0], &params[1]) {
            (Param::Str(bytes), Param::WStr(units)) => {
                assert_eq!(args[0], bytes.as_ptr() as usize);
                assert_eq!(args[1], units.as_ptr() as usize);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_lower_rejects_wide_values() {
        assert!(lower_args(&[Param::I64(1)]).is_err());
        assert!(lower_args(&[Param::F64(1.0)]).is_err());
    }

    #[test]
    fn test_invoke_rejects_param_count_mismatch() {
        let memory = FakeMemory::new();
        let err = invoke(&memory, &record(CallConvention::Cdecl, 2), &[Param::I32(1)]).unwrap_err();
        assert!(err.to_string().contains("Parameter count mismatch"));
    }

    #[test]
    fn test_invoke_rejects_fastcall() {
        let memory = FakeMemory::new();
        let err = invoke(&memory, &record(CallConvention::Fastcall, 0), &[]).unwrap_err();
        assert!(err.to_string().contains("Fastcall"));
    }

    #[test]
    fn test_invoke_rejects_arity_above_six() {
        let memory = FakeMemory::new();
        let params = vec![Param::I32(0); 7];
        let err = invoke(&memory, &record(CallConvention::Cdecl, 7), &params).unwrap_err();
        assert!(err.to_string().contains("max 6"));
    }

    #[test]
    fn test_thiscall_requires_committed_instance() {
        let memory = FakeMemory::new();
        // Null instance pointer.
        let err = invoke(
            &memory,
            &record(CallConvention::Thiscall, 1),
            &[Param::Pointer(0)],
        )
        .unwrap_err();
        assert!(err.to_string().contains("instance pointer"));

        // Uncommitted instance pointer.
        let err = invoke(
            &memory,
            &record(CallConvention::Thiscall, 1),
            &[Param::Pointer(0xDEAD_0000)],
        )
        .unwrap_err();
        assert!(err.to_string().contains("not committed"));
    }

    // Real trampoline round-trips only exist on the target ABI.
    #[cfg(all(windows, target_arch = "x86"))]
    mod native {
        use super::*;

        extern "cdecl" fn add(a: usize, b: usize) -> usize {
            a.wrapping_add(b)
        }

        extern "stdcall" fn triple(a: usize) -> usize {
            a * 3
        }

        #[test]
        fn test_cdecl_add_through_dispatch() {
            let value = dispatch(CallConvention::Cdecl, add as usize, &[7, 35]).unwrap();
            assert_eq!(value, 42);
        }

        #[test]
        fn test_stdcall_through_dispatch() {
            let value = dispatch(CallConvention::Stdcall, triple as usize, &[5]).unwrap();
            assert_eq!(value, 15);
        }
    }
}
