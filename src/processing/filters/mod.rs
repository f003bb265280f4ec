pub mod bandpass;

pub trait FilterInstance: Send {
    fn id(&self) -> &str;
    fn process_chunk(&mut self, input: &[f64]) -> Vec<f64>;
    fn reset(&mut self);
}
