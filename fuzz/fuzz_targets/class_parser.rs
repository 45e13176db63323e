#![no_main]

use huella::classfile::ClassFile;
use huella::instrument::{Instrumenter, NotifyStrategy};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Parsing must reject bad input with an error, never a panic
    if let Ok(class) = ClassFile::parse(data) {
        for method in &class.methods {
            let _ = method.code(&class.constant_pool);
        }
        // Rewriting goes through the raw rewrite so a panic is not swallowed
        for strategy in [NotifyStrategy::Direct, NotifyStrategy::CallSite] {
            let _ = Instrumenter::new(strategy).rewrite(class.clone());
        }
    }
});
