use std::collections::VecDeque;
use std::sync::Mutex;

use rand::Rng;

/// Source of the numeric one-time codes used in the visit handshake.
pub trait CodeGenerator: Send + Sync {
    fn generate(&self, length: usize) -> String;
}

pub struct RandomCodeGenerator;

impl CodeGenerator for RandomCodeGenerator {
    fn generate(&self, length: usize) -> String {
        let mut rng = rand::thread_rng();
        (0..length)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect()
    }
}

/// Hands out preset codes in order, falling back to random ones when empty.
#[derive(Default)]
pub struct ScriptedCodeGenerator {
    queued: Mutex<VecDeque<String>>,
}

impl ScriptedCodeGenerator {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queued: Mutex::new(codes.into_iter().map(Into::into).collect()),
        }
    }

    pub fn push(&self, code: impl Into<String>) {
        if let Ok(mut queued) = self.queued.lock() {
            queued.push_back(code.into());
        }
    }
}

impl CodeGenerator for ScriptedCodeGenerator {
    fn generate(&self, length: usize) -> String {
        let next = self.queued.lock().ok().and_then(|mut q| q.pop_front());
        next.unwrap_or_else(|| RandomCodeGenerator.generate(length))
    }
}

pub fn is_numeric_code(code: &str, length: usize) -> bool {
    code.len() == length && code.bytes().all(|b| b.is_ascii_digit())
}
