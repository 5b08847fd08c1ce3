/// Three- and four-vector types used to describe event kinematics.
pub mod vectors;
