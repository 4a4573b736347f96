mod csi;
mod device;
mod state;
mod support;
