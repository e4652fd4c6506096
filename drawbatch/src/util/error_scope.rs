use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use wgpu::Device;

#[must_use = "All error scopes must end in a call to `end`"]
pub struct ValidationErrorScope<'a> {
    device: &'a Device,
}

impl<'a> ValidationErrorScope<'a> {
    pub fn new(device: &'a Device) -> Self {
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        Self { device }
    }

    pub fn end(self) -> Result<(), wgpu::Error> {
        let mut future = self.device.pop_error_scope();
        let pin = Pin::new(&mut future);
        match pin.poll(&mut Context::from_waker(&noop_waker::noop_waker())) {
            Poll::Ready(Some(error)) => Err(error),
            Poll::Ready(None) => Ok(()),
            // webgpu resolves scopes asynchronously
            Poll::Pending => Ok(()),
        }
    }
}
