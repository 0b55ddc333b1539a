//! 과거 시세 데이터 접근을 위한 도메인 모델.

mod bar;
mod calendar;
mod range;

pub use bar::*;
pub use calendar::*;
pub use range::*;
