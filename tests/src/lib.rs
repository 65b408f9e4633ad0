//! Cross-crate tests for the obfuscation pipeline.

#[cfg(test)]
mod pipeline;
#[cfg(test)]
mod transforms;

#[cfg(test)]
pub(crate) mod support {
    use phantom_core::interp::Machine;
    use phantom_core::ir::Module;

    pub(crate) fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    /// Interpreter with the host functions the `calls` sample declares.
    pub(crate) fn machine(module: &Module) -> Machine<'_> {
        let mut m = Machine::new(module).unwrap();
        m.register_host("host_scale", Box::new(|args| args[0] * 10));
        m.register_host(
            "abs",
            Box::new(|args| (args[0] as u32 as i32).unsigned_abs() as u64),
        );
        m
    }

    /// Asserts the sample programs still compute what they computed before obfuscation.
    pub(crate) fn assert_samples_behave(module: &Module) {
        let mut m = machine(module);
        match module.name.as_str() {
            "sum_to_n" => {
                for (n, sum) in [(0u64, 0u64), (1, 1), (10, 55), (100, 5050)] {
                    assert_eq!(m.call("sum_to_n", &[n]).unwrap(), Some(sum));
                }
            }
            "compute" => {
                assert_eq!(m.call("compute", &[10, 20]).unwrap(), Some(185));
                let expected = (((7i32 + -3) * 2) ^ 0xff) - 7;
                assert_eq!(
                    m.call("compute", &[7, (-3i32) as u32 as u64]).unwrap(),
                    Some(expected as u32 as u64)
                );
            }
            "classify" => {
                for (x, sign) in [(-5i32, -1i32), (0, 0), (17, 1), (i32::MIN, -1)] {
                    assert_eq!(
                        m.call("classify", &[x as u32 as u64]).unwrap(),
                        Some(sign as u32 as u64)
                    );
                }
            }
            "calls" => assert_eq!(m.call("main", &[]).unwrap(), Some(48)),
            other => panic!("no expectations for sample {other}"),
        }
    }
}
